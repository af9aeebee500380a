//! In-memory state store
//!
//! All entities live in one [`State`] value behind a single `RwLock`. Readers
//! get an `Arc` snapshot that never changes underneath them; writers build the
//! next state on a copy, persist the touched documents, and only then swap it
//! in. A failed validation or write leaves the current state untouched.

pub mod persist;

pub use persist::{Document, Documents, StoreError, write_atomic};

use crate::error::CoreError;
use crate::model::{ApplyStatus, Device, Group, Routes, Service, Subscription, Tunnel};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct State {
    pub services: Vec<Service>,
    pub devices: Vec<Device>,
    pub tunnels: Vec<Tunnel>,
    pub groups: Vec<Group>,
    pub subscriptions: Vec<Subscription>,
    pub routes: Routes,
    pub status: ApplyStatus,
}

impl State {
    pub fn service(&self, id: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.id == id)
    }

    pub fn service_mut(&mut self, id: &str) -> Result<&mut Service, CoreError> {
        self.services
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| CoreError::not_found("service", id))
    }

    pub fn device(&self, id: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == id)
    }

    pub fn device_mut(&mut self, id: &str) -> Result<&mut Device, CoreError> {
        self.devices
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| CoreError::not_found("device", id))
    }

    pub fn tunnel(&self, tag: &str) -> Option<&Tunnel> {
        self.tunnels.iter().find(|t| t.tag == tag)
    }

    pub fn group(&self, tag: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.tag == tag)
    }

    pub fn group_mut(&mut self, tag: &str) -> Result<&mut Group, CoreError> {
        self.groups
            .iter_mut()
            .find(|g| g.tag == tag)
            .ok_or_else(|| CoreError::not_found("group", tag))
    }

    pub fn subscription_mut(&mut self, id: &str) -> Result<&mut Subscription, CoreError> {
        self.subscriptions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| CoreError::not_found("subscription", id))
    }

    /// True if `tag` names a tunnel or a group
    pub fn outbound_exists(&self, tag: &str) -> bool {
        self.tunnel(tag).is_some() || self.group(tag).is_some()
    }

    /// Insert or update tunnels by tag. Returns the number of new tags.
    pub fn merge_tunnels(&mut self, incoming: Vec<Tunnel>) -> usize {
        let mut added = 0;
        for tunnel in incoming {
            match self.tunnels.iter_mut().find(|t| t.tag == tunnel.tag) {
                Some(existing) => {
                    debug!("Updating tunnel {}", tunnel.tag);
                    existing.update_connection(tunnel);
                }
                None => {
                    debug!("Adding tunnel {}", tunnel.tag);
                    self.tunnels.push(tunnel);
                    added += 1;
                }
            }
        }
        added
    }
}

pub struct StateStore {
    state: RwLock<Arc<State>>,
    docs: Option<Documents>,
}

impl StateStore {
    /// Load state from `data_dir`, persisting every later mutation there
    pub fn open(data_dir: &Path) -> Self {
        let docs = Documents::new(data_dir);
        let state = docs.load_state();
        Self {
            state: RwLock::new(Arc::new(state)),
            docs: Some(docs),
        }
    }

    /// Store without persistence
    pub fn in_memory(state: State) -> Self {
        Self {
            state: RwLock::new(Arc::new(state)),
            docs: None,
        }
    }

    /// Immutable view of the current state
    pub async fn snapshot(&self) -> Arc<State> {
        Arc::clone(&*self.state.read().await)
    }

    /// Run `f` against a copy of the state; on success persist `touched` and
    /// publish the copy.
    pub async fn mutate<T, F>(&self, touched: &[Document], f: F) -> Result<T, CoreError>
    where
        F: FnOnce(&mut State) -> Result<T, CoreError>,
    {
        let mut guard = self.state.write().await;
        let mut next = State::clone(&guard);
        let out = f(&mut next)?;

        if let Some(docs) = &self.docs {
            for doc in touched {
                docs.save(*doc, &next)?;
            }
        }

        *guard = Arc::new(next);
        Ok(out)
    }
}
