//! Retry ledger and the background driver replaying it.
//!
//! A request made with `ignore_failure_policy` that fails is parked in the
//! owning service's [`RetryLedger`]. A [`RetryDriver`] periodically replays
//! every parked request through the service's own operations; the
//! operations clear their entry once they succeed.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Weak;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{DiscoveryResult, Operation};
use crate::metrics;
use crate::model::{RegisterInfo, SubscribeInfo};
use crate::service::{Listener, NamingService};

/// Pending requests awaiting a background retry.
///
/// Safe for concurrent use by callers and the retry driver; iteration works
/// on snapshots, so entries may be added or removed while a tick runs.
#[derive(Debug, Default)]
pub struct RetryLedger {
    registers: DashSet<RegisterInfo>,
    unregisters: DashSet<RegisterInfo>,
    subscribes: DashMap<SubscribeInfo, Listener>,
    unsubscribes: DashSet<SubscribeInfo>,
}

/// Entry counts of a [`RetryLedger`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerSizes {
    /// Parked registers.
    pub registers: usize,
    /// Parked unregisters.
    pub unregisters: usize,
    /// Parked subscribes.
    pub subscribes: usize,
    /// Parked unsubscribes.
    pub unsubscribes: usize,
}

impl LedgerSizes {
    /// Entries of every kind.
    pub fn total(&self) -> usize {
        self.registers + self.unregisters + self.subscribes + self.unsubscribes
    }
}

impl RetryLedger {
    /// Empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a failed register. Returns false if it was already parked.
    pub fn defer_register(&self, info: RegisterInfo) -> bool {
        self.registers.insert(info)
    }

    /// Drop a parked register. Returns false if none was parked.
    pub fn clear_register(&self, info: &RegisterInfo) -> bool {
        self.registers.remove(info).is_some()
    }

    /// Whether a register is parked.
    pub fn contains_register(&self, info: &RegisterInfo) -> bool {
        self.registers.contains(info)
    }

    /// Snapshot of the parked registers.
    pub fn pending_registers(&self) -> Vec<RegisterInfo> {
        self.registers.iter().map(|info| info.key().clone()).collect()
    }

    /// Park a failed unregister. Returns false if it was already parked.
    pub fn defer_unregister(&self, info: RegisterInfo) -> bool {
        self.unregisters.insert(info)
    }

    /// Drop a parked unregister. Returns false if none was parked.
    pub fn clear_unregister(&self, info: &RegisterInfo) -> bool {
        self.unregisters.remove(info).is_some()
    }

    /// Whether an unregister is parked.
    pub fn contains_unregister(&self, info: &RegisterInfo) -> bool {
        self.unregisters.contains(info)
    }

    /// Snapshot of the parked unregisters.
    pub fn pending_unregisters(&self) -> Vec<RegisterInfo> {
        self.unregisters.iter().map(|info| info.key().clone()).collect()
    }

    /// Park a failed subscribe. The first listener parked for a target
    /// wins; returns false if the target was already parked.
    pub fn defer_subscribe(&self, info: SubscribeInfo, listener: Listener) -> bool {
        match self.subscribes.entry(info) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(listener);
                true
            }
        }
    }

    /// Drop a parked subscribe and its listener.
    pub fn clear_subscribe(&self, info: &SubscribeInfo) -> bool {
        self.subscribes.remove(info).is_some()
    }

    /// Whether a subscribe is parked.
    pub fn contains_subscribe(&self, info: &SubscribeInfo) -> bool {
        self.subscribes.contains_key(info)
    }

    /// Snapshot of the parked subscribes with their listeners.
    pub fn pending_subscribes(&self) -> Vec<(SubscribeInfo, Listener)> {
        self.subscribes
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Park a failed unsubscribe. Returns false if it was already parked.
    pub fn defer_unsubscribe(&self, info: SubscribeInfo) -> bool {
        self.unsubscribes.insert(info)
    }

    /// Drop a parked unsubscribe.
    pub fn clear_unsubscribe(&self, info: &SubscribeInfo) -> bool {
        self.unsubscribes.remove(info).is_some()
    }

    /// Whether an unsubscribe is parked.
    pub fn contains_unsubscribe(&self, info: &SubscribeInfo) -> bool {
        self.unsubscribes.contains(info)
    }

    /// Snapshot of the parked unsubscribes.
    pub fn pending_unsubscribes(&self) -> Vec<SubscribeInfo> {
        self.unsubscribes.iter().map(|info| info.key().clone()).collect()
    }

    /// Current entry counts.
    pub fn sizes(&self) -> LedgerSizes {
        LedgerSizes {
            registers: self.registers.len(),
            unregisters: self.unregisters.len(),
            subscribes: self.subscribes.len(),
            unsubscribes: self.unsubscribes.len(),
        }
    }

    /// Whether nothing is parked.
    pub fn is_empty(&self) -> bool {
        self.sizes().total() == 0
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.registers.clear();
        self.unregisters.clear();
        self.subscribes.clear();
        self.unsubscribes.clear();
    }
}

/// A naming service whose failed requests can be replayed from a ledger.
pub trait Retryable: NamingService {
    /// Ledger holding the service's parked requests.
    fn ledger(&self) -> &RetryLedger;
}

/// Outcome of one [`retry_pending`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryStats {
    /// Entries replayed.
    pub attempted: usize,
    /// Entries whose replay cleared them from the ledger.
    pub cleared: usize,
    /// Ledger contents after the pass.
    pub pending: LedgerSizes,
}

/// Replay every parked request once, in the order registers, unregisters,
/// subscribes, unsubscribes. Entries removed from the ledger after the
/// snapshot was taken are skipped. A failing or panicking replay is logged
/// and does not stop the pass.
pub async fn retry_pending<S: Retryable>(service: &S) -> RetryStats {
    let ledger = service.ledger();
    let mut stats = RetryStats::default();

    for info in ledger.pending_registers() {
        if !ledger.contains_register(&info) {
            continue;
        }
        let outcome = replay(service.register(&info)).await;
        stats.record(Operation::Register, &info.path(), outcome, ledger.contains_register(&info));
    }
    for info in ledger.pending_unregisters() {
        if !ledger.contains_unregister(&info) {
            continue;
        }
        let outcome = replay(service.unregister(&info)).await;
        stats.record(
            Operation::Unregister,
            &info.path(),
            outcome,
            ledger.contains_unregister(&info),
        );
    }
    for (info, listener) in ledger.pending_subscribes() {
        if !ledger.contains_subscribe(&info) {
            continue;
        }
        let outcome = replay(service.subscribe(&info, listener)).await;
        stats.record(
            Operation::Subscribe,
            &info.path(),
            outcome,
            ledger.contains_subscribe(&info),
        );
    }
    for info in ledger.pending_unsubscribes() {
        if !ledger.contains_unsubscribe(&info) {
            continue;
        }
        let outcome = replay(service.unsubscribe(&info)).await;
        stats.record(
            Operation::Unsubscribe,
            &info.path(),
            outcome,
            ledger.contains_unsubscribe(&info),
        );
    }

    stats.pending = ledger.sizes();
    for (op, count) in [
        (Operation::Register, stats.pending.registers),
        (Operation::Unregister, stats.pending.unregisters),
        (Operation::Subscribe, stats.pending.subscribes),
        (Operation::Unsubscribe, stats.pending.unsubscribes),
    ] {
        metrics::NAMING_LEDGER_PENDING
            .with_label_values(&[op.as_str()])
            .set(count as i64);
    }
    metrics::NAMING_RETRY_TICKS.inc();
    stats
}

/// `None` if the replay panicked.
async fn replay<F>(fut: F) -> Option<DiscoveryResult<()>>
where
    F: Future<Output = DiscoveryResult<()>>,
{
    AssertUnwindSafe(fut).catch_unwind().await.ok()
}

impl RetryStats {
    fn record(
        &mut self,
        op: Operation,
        path: &str,
        outcome: Option<DiscoveryResult<()>>,
        still_pending: bool,
    ) {
        self.attempted += 1;
        match outcome {
            None => warn!(%op, path, "retry panicked"),
            Some(Err(err)) => warn!(%op, path, error = %err, "retry failed"),
            Some(Ok(())) if still_pending => debug!(%op, path, "retry still failing"),
            Some(Ok(())) => {
                self.cleared += 1;
                metrics::NAMING_RETRY_SUCCESS
                    .with_label_values(&[op.as_str()])
                    .inc();
                info!(%op, path, "retry succeeded");
            }
        }
    }
}

/// Background task running [`retry_pending`] every `interval`.
///
/// The driver only holds a weak reference to its service: it exits on its
/// own once the service is dropped. A tick starts `interval` after the
/// previous one finished, so ticks never overlap.
#[derive(Debug)]
pub struct RetryDriver {
    interval: Duration,
    token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RetryDriver {
    /// Start driving `service`. Must be called within a tokio runtime.
    pub fn spawn<S: Retryable>(service: Weak<S>, interval: Duration) -> Self {
        let token = CancellationToken::new();
        let task = tokio::spawn(drive(service, interval, token.clone()));
        Self {
            interval,
            token,
            task: Mutex::new(Some(task)),
        }
    }

    /// Delay between ticks.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether [`stop`](Self::stop) has not been called yet.
    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Cancel the driver and wait for its task. Idempotent; an in-flight
    /// tick is abandoned.
    pub async fn stop(&self) {
        self.token.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(error = %err, "retry driver task failed");
            }
        }
    }
}

impl Drop for RetryDriver {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn drive<S: Retryable>(service: Weak<S>, interval: Duration, token: CancellationToken) {
    debug!(?interval, "retry driver started");
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        let Some(service) = service.upgrade() else {
            debug!("naming service dropped");
            break;
        };
        tokio::select! {
            _ = token.cancelled() => break,
            stats = retry_pending(&*service) => {
                if stats.attempted > 0 {
                    debug!(
                        attempted = stats.attempted,
                        cleared = stats.cleared,
                        pending = stats.pending.total(),
                        "retry tick finished"
                    );
                }
            }
        }
    }
    debug!("retry driver stopped");
}
