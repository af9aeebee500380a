//! Operation surface for the admin UI and the CLI
//!
//! Every mutation validates its input before touching state, runs as a single
//! store mutation and persists only the documents it changed. Only
//! [`Controller::apply`], [`Controller::health_check`] and the fetching
//! importers reach outside the process.

use crate::apply::{Applier, ApplyProgress, ApplyReport};
use crate::config::Config;
use crate::error::CoreError;
use crate::health::{HealthMonitor, HealthReport, Prober, TcpProber};
use crate::import::{
    SourceContent, fetch_source, fetch_subscription, parse_link, read_leases,
};
use crate::model::{
    ALL_SERVICES, ApplyStatus, Device, DeviceMode, Group, GroupPolicy, Latency, Routes, Service,
    Subscription, SubscriptionFormat, Tunnel,
};
use crate::normalize::{NormalizeError, normalize_domains, normalize_mac, normalize_networks};
use crate::platform::{Platform, PlatformError, get_platform};
use crate::store::{Document, State, StateStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Result shape handed across the RPC boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outcome<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> From<Result<T, CoreError>> for Outcome<T> {
    fn from(result: Result<T, CoreError>) -> Self {
        match result {
            Ok(data) => Outcome {
                success: true,
                data: Some(data),
                error: None,
            },
            Err(e) => Outcome {
                success: false,
                data: None,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Fields for a manually added device
#[derive(Debug, Clone, Default)]
pub struct NewDevice {
    pub name: String,
    pub ip: Option<String>,
    pub mac: Option<String>,
    pub mode: DeviceMode,
    pub services: Vec<String>,
}

/// Partial device edit; `None` leaves the field alone
#[derive(Debug, Clone, Default)]
pub struct DeviceUpdate {
    pub name: Option<String>,
    pub mode: Option<DeviceMode>,
    pub enabled: Option<bool>,
    pub services: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Discovery {
    pub added: Vec<String>,
    pub updated: Vec<String>,
}

fn next_id<'a>(prefix: &str, taken: impl Iterator<Item = &'a str>) -> String {
    let taken: BTreeSet<&str> = taken.collect();
    (1..)
        .map(|n| format!("{}{}", prefix, n))
        .find(|id| !taken.contains(id.as_str()))
        .unwrap_or_else(|| prefix.to_string())
}

fn parse_ip(raw: &str) -> Result<IpAddr, CoreError> {
    raw.trim()
        .parse()
        .map_err(|_| NormalizeError::InvalidNetwork(raw.to_string()).into())
}

fn check_service_ids(state: &State, ids: &[String]) -> Result<(), CoreError> {
    match ids.iter().find(|id| state.service(id).is_none()) {
        Some(missing) => Err(CoreError::not_found("service", missing.as_str())),
        None => Ok(()),
    }
}

/// Remove a tunnel or group tag from everything that points at it
fn forget_outbound(state: &mut State, tag: &str) {
    state.routes.forget_outbound(tag);
    for group in state.groups.iter_mut() {
        group.members.retain(|m| m != tag);
        if group.selected.as_deref() == Some(tag) {
            group.selected = match group.policy {
                GroupPolicy::Manual => group.members.first().cloned(),
                GroupPolicy::Auto => None,
            };
        }
    }
}

pub struct Controller {
    config: Arc<Config>,
    store: StateStore,
    applier: Applier,
    health: HealthMonitor,
}

impl Controller {
    pub fn new(
        config: Arc<Config>,
        store: StateStore,
        platform: Platform,
        prober: Arc<dyn Prober>,
    ) -> Self {
        let applier = Applier::new(Arc::clone(&config), platform);
        let health = HealthMonitor::new(prober, config.health.clone());
        Self {
            config,
            store,
            applier,
            health,
        }
    }

    /// Open the persisted store and bind to the host platform
    pub fn open(config: Arc<Config>) -> Result<Self, PlatformError> {
        let platform = get_platform(&config)?;
        let store = StateStore::open(&config.paths.data_dir);
        Ok(Self::new(config, store, platform, Arc::new(TcpProber)))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn snapshot(&self) -> Arc<State> {
        self.store.snapshot().await
    }

    // ---- services ----

    pub async fn services(&self) -> Vec<Service> {
        self.store.snapshot().await.services.clone()
    }

    pub async fn service(&self, id: &str) -> Result<Service, CoreError> {
        self.store
            .snapshot()
            .await
            .service(id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("service", id))
    }

    pub async fn set_service_enabled(&self, id: &str, enabled: bool) -> Result<(), CoreError> {
        self.store
            .mutate(&[Document::Services], |state| {
                state.service_mut(id)?.enabled = enabled;
                Ok(())
            })
            .await?;
        info!("Service {} {}", id, if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    /// Add user domains; all entries are validated before any is stored
    pub async fn add_custom_domains(&self, id: &str, raw: &[String]) -> Result<(), CoreError> {
        let domains = normalize_domains(raw)?;
        self.store
            .mutate(&[Document::Services], |state| {
                let svc = state.service_mut(id)?;
                for domain in domains {
                    if !svc.custom_domains.contains(&domain) {
                        svc.custom_domains.push(domain);
                    }
                }
                Ok(())
            })
            .await
    }

    pub async fn remove_custom_domains(&self, id: &str, raw: &[String]) -> Result<(), CoreError> {
        let domains = normalize_domains(raw)?;
        self.store
            .mutate(&[Document::Services], |state| {
                state
                    .service_mut(id)?
                    .custom_domains
                    .retain(|d| !domains.contains(d));
                Ok(())
            })
            .await
    }

    pub async fn add_custom_networks(&self, id: &str, raw: &[String]) -> Result<(), CoreError> {
        let networks = normalize_networks(raw)?;
        self.store
            .mutate(&[Document::Services], |state| {
                let svc = state.service_mut(id)?;
                for net in networks {
                    if !svc.custom_ips.contains(&net) {
                        svc.custom_ips.push(net);
                    }
                }
                Ok(())
            })
            .await
    }

    pub async fn remove_custom_networks(&self, id: &str, raw: &[String]) -> Result<(), CoreError> {
        let networks = normalize_networks(raw)?;
        self.store
            .mutate(&[Document::Services], |state| {
                state
                    .service_mut(id)?
                    .custom_ips
                    .retain(|n| !networks.contains(n));
                Ok(())
            })
            .await
    }

    /// Create an empty user-defined service
    pub async fn create_service(
        &self,
        id: &str,
        name: &str,
        category: &str,
    ) -> Result<Service, CoreError> {
        let valid_id = !id.is_empty()
            && id != ALL_SERVICES
            && id
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
        if !valid_id {
            return Err(CoreError::InvalidRequest(format!(
                "service id {:?} must be lower-case letters, digits, '-' or '_'",
                id
            )));
        }

        let mut svc = Service::new(id, if name.is_empty() { id } else { name });
        svc.category = category.to_string();
        svc.custom = true;

        self.store
            .mutate(&[Document::Services], move |state| {
                if state.service(id).is_some() {
                    return Err(CoreError::Conflict(format!("service {} already exists", id)));
                }
                state.services.push(svc.clone());
                Ok(svc)
            })
            .await
    }

    /// Delete a user-defined service along with its route and device references
    pub async fn delete_service(&self, id: &str) -> Result<(), CoreError> {
        self.store
            .mutate(
                &[Document::Services, Document::Routes, Document::Devices],
                |state| {
                    let svc = state
                        .service(id)
                        .ok_or_else(|| CoreError::not_found("service", id))?;
                    if !svc.custom {
                        return Err(CoreError::InvalidRequest(format!(
                            "{} is a bundled service and cannot be deleted",
                            id
                        )));
                    }
                    state.services.retain(|s| s.id != id);
                    state.routes.overrides.remove(id);
                    for device in state.devices.iter_mut() {
                        device.services.retain(|s| s != id);
                    }
                    Ok(())
                },
            )
            .await?;
        info!("Deleted service {}", id);
        Ok(())
    }

    /// Re-download a service's source lists and replace its read-only entries.
    /// Any failing source leaves the service unchanged.
    pub async fn refresh_sources(&self, id: &str) -> Result<SourceContent, CoreError> {
        let svc = self.service(id).await?;
        if svc.sources.is_empty() {
            return Err(CoreError::InvalidRequest(format!(
                "service {} has no source lists",
                id
            )));
        }

        let mut content = SourceContent::default();
        for source in &svc.sources {
            content.extend(fetch_source(source, &self.config.subscriptions).await?);
        }

        let domains: Vec<String> = content.domains.iter().cloned().collect();
        let networks = content.networks.iter().copied().collect();
        self.store
            .mutate(&[Document::Services], |state| {
                let svc = state.service_mut(id)?;
                svc.domains = domains;
                svc.ips = networks;
                Ok(())
            })
            .await?;
        info!(
            "Service {}: {} domains, {} networks from sources",
            id,
            content.domains.len(),
            content.networks.len()
        );
        Ok(content)
    }

    // ---- devices ----

    pub async fn devices(&self) -> Vec<Device> {
        self.store.snapshot().await.devices.clone()
    }

    pub async fn add_device(&self, new: NewDevice) -> Result<Device, CoreError> {
        let ip = new.ip.as_deref().map(parse_ip).transpose()?;
        let mac = new.mac.as_deref().map(normalize_mac).transpose()?;
        if ip.is_none() && mac.is_none() {
            return Err(CoreError::InvalidRequest(
                "a device needs an ip or a mac address".to_string(),
            ));
        }

        let device = self
            .store
            .mutate(&[Document::Devices], move |state| {
                if let Some(other) = state
                    .devices
                    .iter()
                    .find(|d| d.shares_identity(ip, mac.as_deref()))
                {
                    return Err(CoreError::Conflict(format!(
                        "address already belongs to device {}",
                        other.id
                    )));
                }
                check_service_ids(state, &new.services)?;

                let id = next_id("d", state.devices.iter().map(|d| d.id.as_str()));
                let device = Device {
                    name: if new.name.is_empty() { id.clone() } else { new.name },
                    id,
                    ip,
                    mac,
                    mode: new.mode,
                    enabled: true,
                    services: new.services,
                };
                state.devices.push(device.clone());
                Ok(device)
            })
            .await?;
        info!("Added device {} ({:?})", device.id, device.mode);
        Ok(device)
    }

    pub async fn update_device(&self, id: &str, update: DeviceUpdate) -> Result<Device, CoreError> {
        self.store
            .mutate(&[Document::Devices], move |state| {
                if let Some(services) = &update.services {
                    check_service_ids(state, services)?;
                }
                let device = state.device_mut(id)?;
                if let Some(name) = update.name {
                    device.name = name;
                }
                if let Some(mode) = update.mode {
                    device.mode = mode;
                }
                if let Some(enabled) = update.enabled {
                    device.enabled = enabled;
                }
                if let Some(services) = update.services {
                    device.services = services;
                }
                Ok(device.clone())
            })
            .await
    }

    /// Remove a device. Its firewall rule disappears at the next apply.
    pub async fn delete_device(&self, id: &str) -> Result<(), CoreError> {
        self.store
            .mutate(&[Document::Devices], |state| {
                state.device_mut(id)?;
                state.devices.retain(|d| d.id != id);
                Ok(())
            })
            .await?;
        info!("Deleted device {}", id);
        Ok(())
    }

    /// Import DHCP clients: new MACs become disabled `default` devices, known
    /// MACs get their address refreshed.
    pub async fn discover_devices(&self) -> Result<Discovery, CoreError> {
        let path = &self.config.paths.leases_file;
        let leases = read_leases(path).map_err(|e| {
            CoreError::Internal(format!("failed to read {}: {}", path.display(), e))
        })?;

        self.store
            .mutate(&[Document::Devices], move |state| {
                let mut found = Discovery::default();
                for lease in leases {
                    if let Some(idx) = state
                        .devices
                        .iter()
                        .position(|d| d.mac.as_deref() == Some(lease.mac.as_str()))
                    {
                        let device = &state.devices[idx];
                        if device.ip.is_none() || device.ip == Some(lease.ip) {
                            continue;
                        }
                        let holder = state
                            .devices
                            .iter()
                            .enumerate()
                            .find(|(i, d)| *i != idx && d.ip == Some(lease.ip));
                        if let Some((_, other)) = holder {
                            warn!(
                                "Lease gives {} to device {}, already held by {}; leaving it",
                                lease.ip, device.id, other.id
                            );
                            continue;
                        }
                        let device = &mut state.devices[idx];
                        device.ip = Some(lease.ip);
                        found.updated.push(device.id.clone());
                        continue;
                    }
                    if state.devices.iter().any(|d| d.ip == Some(lease.ip)) {
                        continue;
                    }

                    let id = next_id("d", state.devices.iter().map(|d| d.id.as_str()));
                    state.devices.push(Device {
                        name: if lease.hostname.is_empty() {
                            lease.mac.clone()
                        } else {
                            lease.hostname
                        },
                        id: id.clone(),
                        ip: Some(lease.ip),
                        mac: Some(lease.mac),
                        mode: DeviceMode::Default,
                        enabled: false,
                        services: Vec::new(),
                    });
                    found.added.push(id);
                }
                Ok(found)
            })
            .await
    }

    // ---- tunnels and groups ----

    pub async fn tunnels(&self) -> Vec<Tunnel> {
        self.store.snapshot().await.tunnels.clone()
    }

    pub async fn groups(&self) -> Vec<Group> {
        self.store.snapshot().await.groups.clone()
    }

    /// Parse a share link and merge it by tag
    pub async fn import_link(&self, uri: &str) -> Result<Tunnel, CoreError> {
        let tunnel = parse_link(uri)?;
        let tag = tunnel.tag.clone();
        let stored = self
            .store
            .mutate(&[Document::Tunnels], move |state| {
                if state.group(&tunnel.tag).is_some() {
                    return Err(CoreError::Conflict(format!(
                        "{} is already a group",
                        tunnel.tag
                    )));
                }
                let tag = tunnel.tag.clone();
                state.merge_tunnels(vec![tunnel]);
                state
                    .tunnel(&tag)
                    .cloned()
                    .ok_or_else(|| CoreError::Internal(format!("tunnel {} vanished", tag)))
            })
            .await?;
        info!("Imported tunnel {}", tag);
        Ok(stored)
    }

    pub async fn set_tunnel_enabled(&self, tag: &str, enabled: bool) -> Result<(), CoreError> {
        self.store
            .mutate(&[Document::Tunnels], |state| {
                let tunnel = state
                    .tunnels
                    .iter_mut()
                    .find(|t| t.tag == tag)
                    .ok_or_else(|| CoreError::not_found("tunnel", tag))?;
                tunnel.enabled = enabled;
                Ok(())
            })
            .await
    }

    /// Delete a tunnel, dropping routes, group membership and the active
    /// pointer that referenced it
    pub async fn delete_tunnel(&self, tag: &str) -> Result<(), CoreError> {
        self.store
            .mutate(&[Document::Tunnels, Document::Routes], |state| {
                if state.tunnel(tag).is_none() {
                    return Err(CoreError::not_found("tunnel", tag));
                }
                state.tunnels.retain(|t| t.tag != tag);
                forget_outbound(state, tag);
                Ok(())
            })
            .await?;
        info!("Deleted tunnel {}", tag);
        Ok(())
    }

    pub async fn create_group(
        &self,
        tag: &str,
        members: Vec<String>,
        policy: GroupPolicy,
    ) -> Result<Group, CoreError> {
        if tag.is_empty() || members.is_empty() {
            return Err(CoreError::InvalidRequest(
                "a group needs a tag and at least one member".to_string(),
            ));
        }
        self.store
            .mutate(&[Document::Tunnels], move |state| {
                if state.outbound_exists(tag) {
                    return Err(CoreError::Conflict(format!("{} already exists", tag)));
                }
                if let Some(missing) = members.iter().find(|m| state.tunnel(m).is_none()) {
                    return Err(CoreError::not_found("tunnel", missing.as_str()));
                }
                let mut unique = Vec::new();
                for m in members {
                    if !unique.contains(&m) {
                        unique.push(m);
                    }
                }
                let group = Group::new(tag, unique, policy);
                state.groups.push(group.clone());
                Ok(group)
            })
            .await
    }

    /// Pick the member of a manual group
    pub async fn select_group_member(&self, tag: &str, member: &str) -> Result<(), CoreError> {
        self.store
            .mutate(&[Document::Tunnels], |state| {
                let group = state.group_mut(tag)?;
                if group.policy != GroupPolicy::Manual {
                    return Err(CoreError::InvalidRequest(format!(
                        "{} selects its member automatically",
                        tag
                    )));
                }
                if !group.members.iter().any(|m| m == member) {
                    return Err(CoreError::not_found("group member", member));
                }
                group.selected = Some(member.to_string());
                group.degraded = false;
                Ok(())
            })
            .await
    }

    pub async fn delete_group(&self, tag: &str) -> Result<(), CoreError> {
        self.store
            .mutate(&[Document::Tunnels, Document::Routes], |state| {
                state.group_mut(tag)?;
                state.groups.retain(|g| g.tag != tag);
                forget_outbound(state, tag);
                Ok(())
            })
            .await
    }

    // ---- routes ----

    pub async fn routes(&self) -> Routes {
        self.store.snapshot().await.routes.clone()
    }

    /// Send a service (or [`ALL_SERVICES`]) through a specific outbound
    pub async fn set_route(&self, service_id: &str, outbound: &str) -> Result<(), CoreError> {
        self.store
            .mutate(&[Document::Routes], |state| {
                if service_id != ALL_SERVICES && state.service(service_id).is_none() {
                    return Err(CoreError::not_found("service", service_id));
                }
                if !state.outbound_exists(outbound) {
                    return Err(CoreError::not_found("outbound", outbound));
                }
                state
                    .routes
                    .overrides
                    .insert(service_id.to_string(), outbound.to_string());
                Ok(())
            })
            .await
    }

    pub async fn clear_route(&self, service_id: &str) -> Result<(), CoreError> {
        self.store
            .mutate(&[Document::Routes], |state| {
                state.routes.overrides.remove(service_id);
                Ok(())
            })
            .await
    }

    /// Set or clear the default outbound
    pub async fn set_active(&self, outbound: Option<&str>) -> Result<(), CoreError> {
        self.store
            .mutate(&[Document::Routes], |state| {
                if let Some(tag) = outbound {
                    if !state.outbound_exists(tag) {
                        return Err(CoreError::not_found("outbound", tag));
                    }
                }
                state.routes.active = outbound.map(str::to_string);
                Ok(())
            })
            .await?;
        info!("Active outbound: {}", outbound.unwrap_or("none"));
        Ok(())
    }

    // ---- subscriptions ----

    pub async fn subscriptions(&self) -> Vec<Subscription> {
        self.store.snapshot().await.subscriptions.clone()
    }

    /// Fetch a subscription, then record it with its tunnels
    pub async fn add_subscription(
        &self,
        name: &str,
        url: &str,
        format: SubscriptionFormat,
    ) -> Result<Subscription, CoreError> {
        url::Url::parse(url)
            .map_err(|e| CoreError::InvalidRequest(format!("invalid url {}: {}", url, e)))?;
        let tunnels = fetch_subscription(url, format, &self.config.subscriptions).await?;
        let sub = Subscription {
            id: String::new(),
            name: if name.is_empty() { url } else { name }.to_string(),
            url: url.to_string(),
            format,
            node_count: 0,
            last_updated: None,
            auto_update: true,
        };
        self.commit_subscription(sub, tunnels).await
    }

    /// Re-fetch and merge; tunnels no longer listed are kept
    pub async fn refresh_subscription(&self, id: &str) -> Result<Subscription, CoreError> {
        let sub = self
            .store
            .snapshot()
            .await
            .subscriptions
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("subscription", id))?;
        let tunnels = fetch_subscription(&sub.url, sub.format, &self.config.subscriptions).await?;
        self.commit_subscription(sub, tunnels).await
    }

    /// Forget a subscription. The tunnels it produced stay.
    pub async fn delete_subscription(&self, id: &str) -> Result<(), CoreError> {
        self.store
            .mutate(&[Document::Subscriptions], |state| {
                state.subscription_mut(id)?;
                state.subscriptions.retain(|s| s.id != id);
                Ok(())
            })
            .await
    }

    /// Refresh auto-updating subscriptions older than the configured age
    pub async fn refresh_stale_subscriptions(
        &self,
        now: DateTime<Utc>,
    ) -> Vec<(String, Result<Subscription, CoreError>)> {
        let hours = self.config.subscriptions.auto_update_hours;
        if hours == 0 {
            return Vec::new();
        }
        // A century is as good as never
        let max_age = chrono::Duration::hours(hours.min(876_000) as i64);
        let stale: Vec<String> = self
            .store
            .snapshot()
            .await
            .subscriptions
            .iter()
            .filter(|s| s.auto_update)
            .filter(|s| s.last_updated.is_none_or(|at| now - at >= max_age))
            .map(|s| s.id.clone())
            .collect();

        let mut results = Vec::with_capacity(stale.len());
        for id in stale {
            let result = self.refresh_subscription(&id).await;
            if let Err(e) = &result {
                warn!("Subscription {} refresh failed: {}", id, e);
            }
            results.push((id, result));
        }
        results
    }

    async fn commit_subscription(
        &self,
        mut sub: Subscription,
        tunnels: Vec<Tunnel>,
    ) -> Result<Subscription, CoreError> {
        sub.node_count = tunnels.len();
        sub.last_updated = Some(Utc::now());

        let sub = self
            .store
            .mutate(&[Document::Tunnels, Document::Subscriptions], move |state| {
                if sub.id.is_empty() {
                    sub.id = next_id("s", state.subscriptions.iter().map(|s| s.id.as_str()));
                }
                let mut tunnels = tunnels;
                for tunnel in tunnels.iter_mut() {
                    if state.group(&tunnel.tag).is_some() {
                        return Err(CoreError::Conflict(format!(
                            "{} is already a group",
                            tunnel.tag
                        )));
                    }
                    tunnel.subscription_id = Some(sub.id.clone());
                }
                let added = state.merge_tunnels(tunnels);
                info!(
                    "Subscription {}: {} nodes, {} new",
                    sub.id, sub.node_count, added
                );

                match state.subscriptions.iter_mut().find(|s| s.id == sub.id) {
                    Some(existing) => {
                        existing.node_count = sub.node_count;
                        existing.last_updated = sub.last_updated;
                        Ok(existing.clone())
                    }
                    None => {
                        state.subscriptions.push(sub.clone());
                        Ok(sub)
                    }
                }
            })
            .await?;
        Ok(sub)
    }

    // ---- external effects ----

    pub async fn apply(&self) -> Result<ApplyReport, CoreError> {
        self.applier.apply(&self.store).await
    }

    pub fn apply_progress(&self) -> watch::Receiver<ApplyProgress> {
        self.applier.subscribe()
    }

    pub async fn health_check(&self) -> Result<HealthReport, CoreError> {
        self.health.check(&self.store).await
    }

    /// Probe one tunnel without recording the result
    pub async fn probe_tunnel(&self, tag: &str) -> Result<Latency, CoreError> {
        let tunnel = self
            .store
            .snapshot()
            .await
            .tunnel(tag)
            .cloned()
            .ok_or_else(|| CoreError::not_found("tunnel", tag))?;
        Ok(self.health.probe(&tunnel).await)
    }

    pub async fn status(&self) -> ApplyStatus {
        self.store.snapshot().await.status.clone()
    }
}
