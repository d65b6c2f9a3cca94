//! Lifecycle engine
//!
//! Two background loops over the registry:
//! - a per-agent heartbeat that refreshes `lastHeartbeat` immediately and
//!   then on every tick; failures go to the error sink and the loop keeps
//!   running
//! - a registry-wide garbage collector that marks stale entries offline
//!   and deletes entries past their TTL
//!
//! Both are explicit objects with start/stop handles. Starting a second
//! heartbeat for the same session supersedes the first; stop is
//! idempotent. Lifecycle depends on the registry; the registry knows
//! nothing about lifecycle.

use chrono::{DateTime, Utc};
use loom_domain::{AgentStatus, LoomError};
use loom_ports::Substrate;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LifecycleConfig;
use crate::registry::Registry;

/// Running heartbeat loop; dropping the handle does not stop the loop.
pub struct HeartbeatHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    /// Idempotent; safe from any exit path.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.task.is_finished()
    }
}

pub struct Heartbeat;

impl Heartbeat {
    /// Spawn the heartbeat loop for `guid`. Writes immediately, then every
    /// `heartbeat_interval`. A missing entry logs and waits for the next
    /// tick; errors are reported through `error_sink` and never terminate
    /// the loop.
    pub fn start<S: Substrate>(
        registry: Registry<S>,
        guid: String,
        config: &LifecycleConfig,
        error_sink: Option<mpsc::UnboundedSender<LoomError>>,
    ) -> HeartbeatHandle {
        let token = CancellationToken::new();
        let loop_token = token.clone();
        let interval = config.heartbeat_interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            debug!(guid = %guid, interval_ms = interval.as_millis() as u64, "Heartbeat started");

            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = beat(&registry, &guid).await {
                            warn!(guid = %guid, error = %e, "Heartbeat write failed");
                            if let Some(sink) = &error_sink {
                                let _ = sink.send(e);
                            }
                        }
                    }
                }
            }
            debug!(guid = %guid, "Heartbeat stopped");
        });

        HeartbeatHandle { token, task }
    }
}

async fn beat<S: Substrate>(registry: &Registry<S>, guid: &str) -> Result<(), LoomError> {
    match registry.get(guid).await? {
        Some(mut entry) => {
            entry.last_heartbeat = Utc::now();
            // A GC-driven offline mark is corrected here: the loop only
            // runs while the agent is actually alive.
            if entry.status == AgentStatus::Offline {
                entry.status = AgentStatus::Online;
            }
            registry.put(&entry).await
        }
        None => {
            debug!(guid, "Heartbeat found no entry; waiting for the next tick");
            Ok(())
        }
    }
}

/// Outcome of one garbage-collection sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GcReport {
    pub scanned: usize,
    pub marked_offline: usize,
    pub deleted: usize,
    pub errors: Vec<String>,
}

pub struct GarbageCollector<S: Substrate> {
    registry: Registry<S>,
    config: LifecycleConfig,
}

impl<S: Substrate> GarbageCollector<S> {
    pub fn new(registry: Registry<S>, config: LifecycleConfig) -> Self {
        GarbageCollector { registry, config }
    }

    /// One sweep over the whole registry. Per-entry failures are collected
    /// in the report; the sweep itself never fails.
    pub async fn run_once(&self, dry_run: bool) -> GcReport {
        let mut report = GcReport::default();
        let now = Utc::now();

        let entries = match self.registry.list().await {
            Ok(entries) => entries,
            Err(e) => {
                report.errors.push(format!("registry listing failed: {e}"));
                return report;
            }
        };

        let stale_after = chrono_duration(self.config.stale_threshold);
        let ttl = chrono_duration(self.config.ttl);

        for mut entry in entries {
            report.scanned += 1;

            if now - entry.registered_at > ttl {
                report.deleted += 1;
                if !dry_run {
                    if let Err(e) = self.registry.delete(&entry.guid).await {
                        report.errors.push(format!("delete {}: {e}", entry.guid));
                    } else {
                        info!(guid = %entry.guid, "Deleted expired registration");
                    }
                }
                continue;
            }

            if entry.is_stale(now, stale_after) && entry.status != AgentStatus::Offline {
                report.marked_offline += 1;
                if !dry_run {
                    entry.status = AgentStatus::Offline;
                    if let Err(e) = self.registry.put(&entry).await {
                        report.errors.push(format!("mark offline {}: {e}", entry.guid));
                    } else {
                        info!(guid = %entry.guid, "Marked stale agent offline");
                    }
                }
            }
        }

        report
    }

    /// Spawn the periodic sweep.
    pub fn start(self) -> GcHandle {
        let token = CancellationToken::new();
        let loop_token = token.clone();
        let interval = self.config.gc_interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // One full interval elapses before the first sweep.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = self.run_once(false).await;
                        if report.marked_offline > 0 || report.deleted > 0 || !report.errors.is_empty() {
                            info!(
                                scanned = report.scanned,
                                marked_offline = report.marked_offline,
                                deleted = report.deleted,
                                errors = report.errors.len(),
                                "Garbage collection sweep"
                            );
                        }
                    }
                }
            }
        });

        GcHandle { token, task }
    }
}

/// Running garbage-collector loop
pub struct GcHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl GcHandle {
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.task.is_finished()
    }
}

fn chrono_duration(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// Strictness helper shared with tests: exactly-threshold is not stale.
pub fn is_stale_at(last_heartbeat: DateTime<Utc>, now: DateTime<Utc>, threshold: std::time::Duration) -> bool {
    now - last_heartbeat > chrono_duration(threshold)
}
