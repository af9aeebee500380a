//! On-disk documents backing the state store
//!
//! Each entity family lives in its own JSON file so a corrupt or missing file
//! only loses that family. Writes are staged to `<name>.tmp` and renamed into
//! place.

use super::State;
use crate::model::{
    ApplyStatus, Device, Group, Routes, Service, Subscription, Tunnel, bundled_services,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to serialize {0}: {1}")]
    Serialize(&'static str, #[source] serde_json::Error),
}

/// One persisted file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Document {
    Services,
    Devices,
    Tunnels,
    Subscriptions,
    Routes,
    Status,
}

impl Document {
    pub const ALL: [Document; 6] = [
        Document::Services,
        Document::Devices,
        Document::Tunnels,
        Document::Subscriptions,
        Document::Routes,
        Document::Status,
    ];

    pub fn file_name(&self) -> &'static str {
        match self {
            Document::Services => "services.json",
            Document::Devices => "devices.json",
            Document::Tunnels => "tunnels.json",
            Document::Subscriptions => "subscriptions.json",
            Document::Routes => "routes.json",
            Document::Status => "status.json",
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ServicesDoc {
    #[serde(default)]
    services: Vec<Service>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DevicesDoc {
    #[serde(default)]
    devices: Vec<Device>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TunnelsDoc {
    #[serde(default)]
    tunnels: Vec<Tunnel>,
    #[serde(default)]
    groups: Vec<Group>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SubscriptionsDoc {
    #[serde(default)]
    subscriptions: Vec<Subscription>,
}

/// Write `contents` to `path` via a sibling staging file and rename.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }

    let mut staging = path.as_os_str().to_owned();
    staging.push(".tmp");
    let staging = PathBuf::from(staging);

    fs::write(&staging, contents).map_err(io_err)?;
    fs::rename(&staging, path).map_err(io_err)?;
    Ok(())
}

/// Directory of persisted documents
#[derive(Debug, Clone)]
pub struct Documents {
    dir: PathBuf,
}

impl Documents {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, doc: Document) -> PathBuf {
        self.dir.join(doc.file_name())
    }

    /// Load every document independently.
    ///
    /// A missing `services.json` seeds the bundled catalog; any other missing
    /// or unreadable document is treated as empty.
    pub fn load_state(&self) -> State {
        let services = if self.path(Document::Services).exists() {
            self.read::<ServicesDoc>(Document::Services).services
        } else {
            match bundled_services() {
                Ok(services) => {
                    info!("Seeding {} bundled services", services.len());
                    services
                }
                Err(e) => {
                    warn!("Bundled service catalog is invalid: {}", e);
                    Vec::new()
                }
            }
        };

        let tunnels = self.read::<TunnelsDoc>(Document::Tunnels);

        State {
            services,
            devices: self.read::<DevicesDoc>(Document::Devices).devices,
            tunnels: tunnels.tunnels,
            groups: tunnels.groups,
            subscriptions: self
                .read::<SubscriptionsDoc>(Document::Subscriptions)
                .subscriptions,
            routes: self.read::<Routes>(Document::Routes),
            status: self.read::<ApplyStatus>(Document::Status),
        }
    }

    fn read<T: DeserializeOwned + Default>(&self, doc: Document) -> T {
        let path = self.path(doc);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("{} not found, starting empty", path.display());
                return T::default();
            }
            Err(e) => {
                warn!("Failed to read {}: {}; treating as empty", path.display(), e);
                return T::default();
            }
        };

        match serde_json::from_str(&content) {
            Ok(value) => value,
            Err(e) => {
                warn!("Corrupt {}: {}; treating as empty", path.display(), e);
                T::default()
            }
        }
    }

    /// Serialize one document from `state`
    pub fn render(&self, doc: Document, state: &State) -> Result<Vec<u8>, StoreError> {
        let name = doc.file_name();
        let result = match doc {
            Document::Services => serde_json::to_vec_pretty(&ServicesDocRef {
                services: &state.services,
            }),
            Document::Devices => serde_json::to_vec_pretty(&DevicesDocRef {
                devices: &state.devices,
            }),
            Document::Tunnels => serde_json::to_vec_pretty(&TunnelsDocRef {
                tunnels: &state.tunnels,
                groups: &state.groups,
            }),
            Document::Subscriptions => serde_json::to_vec_pretty(&SubscriptionsDocRef {
                subscriptions: &state.subscriptions,
            }),
            Document::Routes => serde_json::to_vec_pretty(&state.routes),
            Document::Status => serde_json::to_vec_pretty(&state.status),
        };
        result.map_err(|e| StoreError::Serialize(name, e))
    }

    pub fn save(&self, doc: Document, state: &State) -> Result<(), StoreError> {
        let bytes = self.render(doc, state)?;
        write_atomic(&self.path(doc), &bytes)?;
        debug!("Saved {}", doc.file_name());
        Ok(())
    }
}

#[derive(Serialize)]
struct ServicesDocRef<'a> {
    services: &'a [Service],
}

#[derive(Serialize)]
struct DevicesDocRef<'a> {
    devices: &'a [Device],
}

#[derive(Serialize)]
struct TunnelsDocRef<'a> {
    tunnels: &'a [Tunnel],
    groups: &'a [Group],
}

#[derive(Serialize)]
struct SubscriptionsDocRef<'a> {
    subscriptions: &'a [Subscription],
}
