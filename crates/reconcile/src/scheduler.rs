//! Poll-driven dispatch of reconciles: one task per resource instance.
//!
//! Different instances reconcile in parallel; a single instance is strictly
//! serialized through the in-flight key set. Wakeups come from the poll
//! interval and from store epoch changes (on-demand on spec edits).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::counter;
use rustc_hash::FxHashSet;
use steward_core::ResourceKey;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{ReconcileError, Reconciler};

#[derive(Debug, Clone, Copy)]
pub struct SchedulerOptions {
    pub poll_interval: Duration,
    /// Deadline for one reconcile pass; a timeout is a retryable error.
    pub timeout: Duration,
}

impl SchedulerOptions {
    pub fn from_env() -> Self {
        let poll = std::env::var("STEWARD_POLL_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(60);
        let timeout = std::env::var("STEWARD_RECONCILE_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(30);
        Self { poll_interval: Duration::from_secs(poll), timeout: Duration::from_secs(timeout) }
    }
}

pub struct Scheduler<S: Clone + Send + Sync + 'static> {
    reconciler: Arc<Reconciler<S>>,
    opts: SchedulerOptions,
    in_flight: Arc<Mutex<FxHashSet<ResourceKey>>>,
}

impl<S: Clone + Send + Sync + 'static> Scheduler<S> {
    pub fn new(reconciler: Reconciler<S>, opts: SchedulerOptions) -> Self {
        Self {
            reconciler: Arc::new(reconciler),
            opts,
            in_flight: Arc::new(Mutex::new(FxHashSet::default())),
        }
    }

    /// Run until `shutdown` flips to true. Sweeps on every tick and on every
    /// store epoch change.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let kind = self.reconciler.kind();
        let mut epoch_rx = self.reconciler.store().subscribe();
        let mut ticker = tokio::time::interval(self.opts.poll_interval);
        info!(kind, poll_secs = self.opts.poll_interval.as_secs(), "scheduler started");
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep().await,
                changed = epoch_rx.changed() => {
                    if changed.is_err() {
                        warn!(kind, "store epoch channel closed; stopping scheduler");
                        break;
                    }
                    self.sweep().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(kind, "shutdown requested; stopping scheduler");
                        break;
                    }
                }
            }
        }
    }

    /// Dispatch one reconcile task per record not already in flight.
    pub async fn sweep(&self) {
        let kind = self.reconciler.kind();
        let records = match self.reconciler.store().list().await {
            Ok(r) => r,
            Err(e) => {
                warn!(kind, error = %e, "store list failed; skipping sweep");
                return;
            }
        };
        for record in records {
            let key = record.key();
            {
                let mut guard = self.in_flight.lock().unwrap();
                if !guard.insert(key.clone()) {
                    // Previous pass for this instance still running.
                    continue;
                }
            }
            let reconciler = Arc::clone(&self.reconciler);
            let in_flight = Arc::clone(&self.in_flight);
            let timeout = self.opts.timeout;
            tokio::spawn(async move {
                let res = tokio::time::timeout(
                    timeout,
                    reconciler.reconcile(key.namespace.as_deref(), &key.name),
                )
                .await
                .unwrap_or(Err(ReconcileError::Timeout));
                match res {
                    Ok(outcome) => {
                        counter!("reconcile_ok", 1u64, "kind" => reconciler.kind());
                        debug!(kind = reconciler.kind(), key = %key, outcome = ?outcome, "reconciled");
                    }
                    Err(e) if e.retryable() => {
                        counter!("reconcile_err", 1u64, "kind" => reconciler.kind());
                        warn!(kind = reconciler.kind(), key = %key, error = %e, "reconcile failed; will retry");
                    }
                    Err(e) => {
                        counter!("reconcile_invariant_err", 1u64, "kind" => reconciler.kind());
                        error!(kind = reconciler.kind(), key = %key, error = %e, "reconcile failed; user intervention required");
                    }
                }
                in_flight.lock().unwrap().remove(&key);
            });
        }
    }
}
