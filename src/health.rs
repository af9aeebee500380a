//! Tunnel health monitoring
//!
//! A batch probes every enabled tunnel concurrently. Each probe has its own
//! timeout and the batch as a whole has a deadline, after which anything still
//! running is aborted and counted as unreachable. Results, including the new
//! selection for auto groups, land in the store as a single mutation.

use crate::config::HealthConfig;
use crate::error::CoreError;
use crate::model::{Group, GroupPolicy, Latency, Tunnel};
use crate::store::{Document, StateStore};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[async_trait]
pub trait Prober: Send + Sync {
    /// Measure one round trip to the endpoint
    async fn probe(&self, server: &str, port: u16) -> std::io::Result<Duration>;
}

/// Time a TCP handshake with the tunnel endpoint
pub struct TcpProber;

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, server: &str, port: u16) -> std::io::Result<Duration> {
        let start = std::time::Instant::now();
        let _stream = TcpStream::connect((server, port)).await?;
        Ok(start.elapsed())
    }
}

async fn probe_with_timeout(prober: &dyn Prober, tunnel: &Tunnel, limit: Duration) -> Latency {
    match tokio::time::timeout(limit, prober.probe(&tunnel.server, tunnel.port)).await {
        Ok(Ok(rtt)) => {
            let ms = u32::try_from(rtt.as_millis()).unwrap_or(u32::MAX);
            debug!("{} answered in {}ms", tunnel.tag, ms);
            Latency::Millis(ms)
        }
        Ok(Err(e)) => {
            debug!("{} unreachable: {}", tunnel.tag, e);
            Latency::Unreachable
        }
        Err(_) => {
            debug!("{} timed out after {:?}", tunnel.tag, limit);
            Latency::Unreachable
        }
    }
}

/// Probe `tunnels` concurrently. Every input tag appears in the result.
pub async fn probe_all(
    prober: Arc<dyn Prober>,
    tunnels: &[Tunnel],
    probe_timeout: Duration,
    batch_timeout: Duration,
) -> BTreeMap<String, Latency> {
    let mut results: BTreeMap<String, Latency> = BTreeMap::new();
    let mut tasks = JoinSet::new();

    for tunnel in tunnels {
        let prober = Arc::clone(&prober);
        let tunnel = tunnel.clone();
        tasks.spawn(async move {
            let latency = probe_with_timeout(prober.as_ref(), &tunnel, probe_timeout).await;
            (tunnel.tag, latency)
        });
    }

    let deadline = Instant::now() + batch_timeout;
    loop {
        match tokio::time::timeout_at(deadline, tasks.join_next()).await {
            Ok(Some(Ok((tag, latency)))) => {
                results.insert(tag, latency);
            }
            Ok(Some(Err(e))) => warn!("Probe task failed: {}", e),
            Ok(None) => break,
            Err(_) => {
                warn!(
                    "Health batch deadline reached with {} probes outstanding",
                    tasks.len()
                );
                tasks.abort_all();
                break;
            }
        }
    }

    for tunnel in tunnels {
        results
            .entry(tunnel.tag.clone())
            .or_insert(Latency::Unreachable);
    }
    results
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub selected: Option<String>,
    pub degraded: bool,
}

/// Pick a group's member from fresh latencies.
///
/// Auto groups take the lowest finite latency, ties going to the member listed
/// first. Members without a measurement are not candidates. When none is
/// reachable the previous selection stays and the group is marked degraded.
pub fn select_best(group: &Group, latencies: &BTreeMap<String, Latency>) -> Selection {
    let millis = |tag: &str| latencies.get(tag).and_then(Latency::millis);

    let mut best: Option<(&str, u32)> = None;
    for member in &group.members {
        if let Some(ms) = millis(member) {
            if best.is_none_or(|(_, b)| ms < b) {
                best = Some((member.as_str(), ms));
            }
        }
    }

    match (group.policy, best) {
        (_, None) => Selection {
            selected: group.selected.clone(),
            degraded: true,
        },
        (GroupPolicy::Auto, Some((tag, _))) => Selection {
            selected: Some(tag.to_string()),
            degraded: false,
        },
        (GroupPolicy::Manual, Some(_)) => Selection {
            selected: group.selected.clone(),
            degraded: group
                .selected
                .as_deref()
                .is_some_and(|s| millis(s).is_none()),
        },
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub latencies: BTreeMap<String, Latency>,
    /// Groups whose selected member changed
    pub changed_groups: Vec<String>,
    pub degraded_groups: Vec<String>,
}

pub struct HealthMonitor {
    prober: Arc<dyn Prober>,
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(prober: Arc<dyn Prober>, config: HealthConfig) -> Self {
        Self { prober, config }
    }

    /// Probe a single tunnel without touching the store
    pub async fn probe(&self, tunnel: &Tunnel) -> Latency {
        probe_with_timeout(self.prober.as_ref(), tunnel, self.config.probe_timeout()).await
    }

    /// Probe all enabled tunnels and write back latencies and group selections
    pub async fn check(&self, store: &StateStore) -> Result<HealthReport, CoreError> {
        let snapshot = store.snapshot().await;
        let targets: Vec<Tunnel> = snapshot
            .tunnels
            .iter()
            .filter(|t| t.enabled)
            .cloned()
            .collect();
        drop(snapshot);

        info!("Probing {} tunnels", targets.len());
        let latencies = probe_all(
            Arc::clone(&self.prober),
            &targets,
            self.config.probe_timeout(),
            self.config.batch_timeout(),
        )
        .await;

        let now = Utc::now();
        store
            .mutate(&[Document::Tunnels], |state| {
                for tunnel in state.tunnels.iter_mut() {
                    if let Some(latency) = latencies.get(&tunnel.tag) {
                        tunnel.latency = *latency;
                        tunnel.last_check = Some(now);
                    }
                }

                let mut report = HealthReport {
                    latencies: latencies.clone(),
                    ..HealthReport::default()
                };
                for group in state.groups.iter_mut() {
                    let selection = select_best(group, &latencies);
                    if selection.selected != group.selected {
                        info!(
                            "Group {} now uses {}",
                            group.tag,
                            selection.selected.as_deref().unwrap_or("-")
                        );
                        report.changed_groups.push(group.tag.clone());
                    }
                    if selection.degraded {
                        warn!("Group {} is degraded", group.tag);
                        report.degraded_groups.push(group.tag.clone());
                    }
                    group.selected = selection.selected;
                    group.degraded = selection.degraded;
                }
                Ok(report)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Protocol, Transport};
    use crate::store::State;
    use std::collections::HashMap;

    /// Answers after the configured delay; missing servers refuse
    struct FakeProber {
        delays: HashMap<String, Duration>,
    }

    #[async_trait]
    impl Prober for FakeProber {
        async fn probe(&self, server: &str, _port: u16) -> std::io::Result<Duration> {
            match self.delays.get(server) {
                Some(delay) => {
                    tokio::time::sleep(*delay).await;
                    Ok(*delay)
                }
                None => Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "refused",
                )),
            }
        }
    }

    fn tunnel(tag: &str) -> Tunnel {
        Tunnel {
            tag: tag.to_string(),
            name: tag.to_string(),
            server: tag.to_string(),
            port: 443,
            protocol: Protocol::Trojan {
                password: "pw".to_string(),
            },
            tls: None,
            transport: Transport::Tcp,
            enabled: true,
            latency: Latency::Unknown,
            last_check: None,
            subscription_id: None,
        }
    }

    fn latencies(entries: &[(&str, Latency)]) -> BTreeMap<String, Latency> {
        entries
            .iter()
            .map(|(tag, l)| (tag.to_string(), *l))
            .collect()
    }

    fn auto_group() -> Group {
        Group::new(
            "auto",
            vec!["A".to_string(), "B".to_string(), "C".to_string()],
            GroupPolicy::Auto,
        )
    }

    #[test]
    fn test_auto_group_picks_lowest_latency() {
        let l = latencies(&[
            ("A", Latency::Millis(40)),
            ("B", Latency::Millis(15)),
            ("C", Latency::Unreachable),
        ]);
        let selection = select_best(&auto_group(), &l);
        assert_eq!(selection.selected.as_deref(), Some("B"));
        assert!(!selection.degraded);
    }

    #[test]
    fn test_ties_go_to_declaration_order() {
        let l = latencies(&[
            ("A", Latency::Unreachable),
            ("B", Latency::Millis(20)),
            ("C", Latency::Millis(20)),
        ]);
        assert_eq!(select_best(&auto_group(), &l).selected.as_deref(), Some("B"));
    }

    #[test]
    fn test_all_unreachable_keeps_previous() {
        let mut group = auto_group();
        group.selected = Some("A".to_string());
        let l = latencies(&[
            ("A", Latency::Unreachable),
            ("B", Latency::Unreachable),
            ("C", Latency::Unreachable),
        ]);
        let selection = select_best(&group, &l);
        assert_eq!(selection.selected.as_deref(), Some("A"));
        assert!(selection.degraded);
    }

    #[test]
    fn test_manual_group_selection_is_untouched() {
        let mut group = auto_group();
        group.policy = GroupPolicy::Manual;
        group.selected = Some("C".to_string());
        let l = latencies(&[("A", Latency::Millis(5)), ("C", Latency::Unreachable)]);
        let selection = select_best(&group, &l);
        assert_eq!(selection.selected.as_deref(), Some("C"));
        assert!(selection.degraded);
    }

    #[tokio::test]
    async fn test_hung_probe_does_not_stall_batch() {
        let prober = Arc::new(FakeProber {
            delays: HashMap::from([
                ("fast".to_string(), Duration::from_millis(5)),
                ("hung".to_string(), Duration::from_secs(30)),
            ]),
        });
        let tunnels = vec![tunnel("fast"), tunnel("hung"), tunnel("refused")];

        let start = std::time::Instant::now();
        let results = probe_all(
            prober,
            &tunnels,
            Duration::from_millis(200),
            Duration::from_secs(5),
        )
        .await;

        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(results["fast"], Latency::Millis(5));
        assert_eq!(results["hung"], Latency::Unreachable);
        assert_eq!(results["refused"], Latency::Unreachable);
    }

    #[tokio::test]
    async fn test_batch_deadline_marks_outstanding_unreachable() {
        let prober = Arc::new(FakeProber {
            delays: HashMap::from([("slow".to_string(), Duration::from_secs(30))]),
        });
        let results = probe_all(
            prober,
            &[tunnel("slow")],
            Duration::from_secs(60),
            Duration::from_millis(100),
        )
        .await;
        assert_eq!(results["slow"], Latency::Unreachable);
    }

    #[tokio::test]
    async fn test_check_updates_store_in_one_mutation() {
        let mut state = State::default();
        state.tunnels = vec![tunnel("A"), tunnel("B"), tunnel("C")];
        state.groups.push(auto_group());
        let store = StateStore::in_memory(state);

        let prober = Arc::new(FakeProber {
            delays: HashMap::from([
                ("A".to_string(), Duration::from_millis(40)),
                ("B".to_string(), Duration::from_millis(15)),
            ]),
        });
        let monitor = HealthMonitor::new(prober, HealthConfig::default());

        let report = monitor.check(&store).await.unwrap();
        assert_eq!(report.changed_groups, vec!["auto"]);

        let state = store.snapshot().await;
        assert_eq!(state.group("auto").unwrap().selected.as_deref(), Some("B"));
        assert_eq!(state.tunnel("C").unwrap().latency, Latency::Unreachable);
        assert!(state.tunnel("A").unwrap().last_check.is_some());
        assert!(state.tunnel("B").unwrap().latency.millis().is_some());
    }
}
