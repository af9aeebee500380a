//! Pushing a compiled rule set to the system
//!
//! One apply runs at a time; a second request while one is in flight is
//! rejected with [`CoreError::Busy`]. The steps run in a fixed order and a
//! failing step never stops the ones after it:
//!
//! 1. render the VPN client config, stage and swap it in, restart the client
//! 2. stage and swap the resolver directives, reload the resolver
//! 3. rebuild the network sets (bulk, then entry by entry on rejection)
//! 4. replace the device chain in one transaction
//! 5. record the outcome in the status document

pub mod nft;
pub mod resolver;

use crate::compiler::{RuleSet, compile};
use crate::config::Config;
use crate::error::CoreError;
use crate::outbound::render_client_config;
use crate::platform::Platform;
use crate::store::{Document, State, StateStore, write_atomic};
use chrono::Utc;
use ipnet::IpNet;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ApplyError {
    #[error("VPN client config failed: {0}")]
    ClientConfigFailed(String),
    #[error("Policy routing failed: {0}")]
    PolicyRouteFailed(String),
    #[error("Failed to write resolver config: {0}")]
    ResolverWriteFailed(String),
    #[error("Resolver reload failed: {0}")]
    ResolverReloadFailed(String),
    #[error("{failed} network set entries failed")]
    FirewallSetFailed { failed: usize },
    #[error("Device rules failed: {0}")]
    DeviceRuleFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyPhase {
    Idle,
    Compiled,
    ClientConfig,
    Resolver,
    NetworkSet,
    DeviceRules,
    Done,
}

/// Last completed phase of the running (or most recent) apply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ApplyProgress {
    pub phase: ApplyPhase,
    pub completed: u8,
    pub total: u8,
}

impl ApplyProgress {
    const TOTAL: u8 = 6;

    fn at(phase: ApplyPhase, completed: u8) -> Self {
        Self {
            phase,
            completed,
            total: Self::TOTAL,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub networks: usize,
    pub domains: usize,
    pub device_rules: usize,
    pub skipped_networks: usize,
    pub failures: Vec<ApplyError>,
}

impl ApplyReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

struct Inner {
    config: Arc<Config>,
    platform: Platform,
    progress: watch::Sender<ApplyProgress>,
}

pub struct Applier {
    inner: Arc<Inner>,
    lock: Mutex<()>,
}

impl Applier {
    pub fn new(config: Arc<Config>, platform: Platform) -> Self {
        let (progress, _) = watch::channel(ApplyProgress::at(ApplyPhase::Idle, 0));
        Self {
            inner: Arc::new(Inner {
                config,
                platform,
                progress,
            }),
            lock: Mutex::new(()),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ApplyProgress> {
        self.inner.progress.subscribe()
    }

    /// Compile the current state and push it to the system
    pub async fn apply(&self, store: &StateStore) -> Result<ApplyReport, CoreError> {
        let _guard = self.lock.try_lock().map_err(|_| CoreError::Busy)?;

        let state = store.snapshot().await;
        let rules = compile(
            &state.services,
            &state.devices,
            &state.routes.overrides,
            state.routes.active.as_deref(),
        );
        info!(
            "Compiled {} networks, {} domains, {} device rules",
            rules.networks.len(),
            rules.domains.len(),
            rules.device_rules.len()
        );
        self.inner
            .progress
            .send_replace(ApplyProgress::at(ApplyPhase::Compiled, 1));

        let inner = Arc::clone(&self.inner);
        let rules = Arc::new(rules);
        let (report, installed) = {
            let state = Arc::clone(&state);
            let rules = Arc::clone(&rules);
            tokio::task::spawn_blocking(move || inner.run(&state, &rules))
                .await
                .map_err(|e| CoreError::Internal(format!("apply task failed: {}", e)))?
        };

        let now = Utc::now();
        let summary = report.clone();
        store
            .mutate(&[Document::Status], move |s| {
                s.status.last_applied_at = Some(now);
                s.status.networks = summary.networks;
                s.status.domains = summary.domains;
                s.status.device_rules = summary.device_rules;
                s.status.skipped_networks = summary.skipped_networks;
                s.status.errors = summary.failures.iter().map(|e| e.to_string()).collect();
                s.status.installed_devices = installed;
                Ok(())
            })
            .await?;

        self.inner
            .progress
            .send_replace(ApplyProgress::at(ApplyPhase::Done, ApplyProgress::TOTAL));

        if report.is_clean() {
            info!("Apply finished");
        } else {
            warn!("Apply finished with {} failed steps", report.failures.len());
        }
        Ok(report)
    }
}

impl Inner {
    fn publish(&self, phase: ApplyPhase, completed: u8) {
        self.progress.send_replace(ApplyProgress::at(phase, completed));
    }

    /// Blocking part of an apply. Returns the report and the device tags that
    /// are installed afterwards.
    fn run(&self, state: &State, rules: &RuleSet) -> (ApplyReport, Vec<String>) {
        let mut report = ApplyReport {
            domains: rules.domains.len(),
            ..ApplyReport::default()
        };

        report.failures.extend(self.client_config(state, rules));
        self.publish(ApplyPhase::ClientConfig, 2);

        if let Err(e) = self.resolver(rules) {
            report.failures.push(e);
        }
        self.publish(ApplyPhase::Resolver, 3);

        let (installed, skipped) = self.network_set(rules);
        report.networks = installed;
        report.skipped_networks = skipped;
        if skipped > 0 {
            report
                .failures
                .push(ApplyError::FirewallSetFailed { failed: skipped });
        }
        self.publish(ApplyPhase::NetworkSet, 4);

        let tags = match self.device_rules(state, rules) {
            Ok(()) => {
                report.device_rules = rules.device_rules.len();
                let mut tags: Vec<String> =
                    rules.device_rules.iter().map(|r| r.tag.clone()).collect();
                tags.dedup();
                tags
            }
            Err(e) => {
                report.failures.push(e);
                state.status.installed_devices.clone()
            }
        };
        self.publish(ApplyPhase::DeviceRules, 5);

        (report, tags)
    }

    fn client_config(&self, state: &State, rules: &RuleSet) -> Vec<ApplyError> {
        let client = &self.config.client;
        let doc = render_client_config(
            &state.tunnels,
            &state.groups,
            rules,
            state.routes.active.as_deref(),
            client,
        );
        let bytes = match serde_json::to_vec_pretty(&doc) {
            Ok(b) => b,
            Err(e) => return vec![ApplyError::ClientConfigFailed(e.to_string())],
        };

        let unchanged = std::fs::read(&client.config_path).is_ok_and(|old| old == bytes);
        if unchanged {
            debug!("VPN client config unchanged, not restarting");
        } else {
            if let Err(e) = write_atomic(&client.config_path, &bytes) {
                error!("Failed to write VPN client config: {}", e);
                return vec![ApplyError::ClientConfigFailed(e.to_string())];
            }
            info!("Restarting VPN client");
            if let Err(e) = self.platform.client.restart() {
                error!("VPN client restart failed: {}", e);
                return vec![ApplyError::ClientConfigFailed(e.to_string())];
            }
        }

        if rules.outbounds().is_empty() {
            return Vec::new();
        }
        let fw = &self.config.firewall;
        match self
            .platform
            .routing
            .ensure_policy_route(&fw.mark, fw.route_table, &client.tun_interface)
        {
            Ok(()) => Vec::new(),
            Err(e) => {
                warn!("Policy routing not installed: {}", e);
                vec![ApplyError::PolicyRouteFailed(e.to_string())]
            }
        }
    }

    fn resolver(&self, rules: &RuleSet) -> Result<(), ApplyError> {
        let cfg = &self.config.resolver;
        let text = resolver::render(&self.config.firewall, rules, &cfg.block_ipv6_domains);

        write_atomic(&cfg.config_path, text.as_bytes()).map_err(|e| {
            error!("Failed to write resolver directives: {}", e);
            ApplyError::ResolverWriteFailed(e.to_string())
        })?;
        debug!("Wrote {} resolver directives", rules.domains.len());

        self.platform.resolver.restart().map_err(|e| {
            error!("Resolver reload failed: {}", e);
            ApplyError::ResolverReloadFailed(e.to_string())
        })
    }

    /// Returns (installed, skipped)
    fn network_set(&self, rules: &RuleSet) -> (usize, usize) {
        let fw = &self.config.firewall;
        let firewall = &self.platform.firewall;
        // Nested entries of different outbounds would overlap in the interval set
        let nets = IpNet::aggregate(&rules.networks.iter().map(|e| e.network).collect::<Vec<_>>());

        match firewall.run_script(&nft::network_sets(fw, &nets)) {
            Ok(()) => {
                info!("Loaded {} networks", nets.len());
                return (nets.len(), 0);
            }
            Err(e) => warn!("Bulk network load rejected, inserting one by one: {}", e),
        }

        if let Err(e) = firewall.run_script(&nft::network_sets(fw, &[])) {
            error!("Failed to reset network sets: {}", e);
            return (0, nets.len());
        }

        let mut installed = 0;
        for net in &nets {
            match firewall.run_script(&nft::network_element(fw, net)) {
                Ok(()) => installed += 1,
                Err(e) => warn!("Skipping network {}: {}", net, e),
            }
        }
        info!(
            "Loaded {} networks, skipped {}",
            installed,
            nets.len() - installed
        );
        (installed, nets.len() - installed)
    }

    fn device_rules(&self, state: &State, rules: &RuleSet) -> Result<(), ApplyError> {
        let script = nft::device_chain(
            &self.config.firewall,
            &rules.device_rules,
            &state.status.installed_devices,
        );
        self.platform.firewall.run_script(&script).map_err(|e| {
            error!("Failed to install device rules: {}", e);
            ApplyError::DeviceRuleFailed(e.to_string())
        })?;
        info!("Installed {} device rules", rules.device_rules.len());
        Ok(())
    }
}
