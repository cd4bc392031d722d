use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tokio::time::Duration;
use tracing::debug;

use crate::scheduler::Debouncer;
use crate::types::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    Applied { sequence: u64 },
    /// A newer call was applied first; this outcome was dropped.
    Stale { sequence: u64 },
    /// Nothing was issued.
    Skipped,
}

/// Hands out increasing sequence numbers and applies outcomes only when they are newer
/// than everything applied so far.
#[derive(Debug, Default)]
pub struct SequenceGate {
    issued: AtomicU64,
    // 0 means nothing applied yet; issued sequences start at 1.
    latest_applied: Mutex<u64>,
}

impl SequenceGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&self) -> u64 {
        self.issued.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn last_issued(&self) -> u64 {
        self.issued.load(Ordering::SeqCst)
    }

    pub async fn latest_applied(&self) -> Option<u64> {
        let latest = *self.latest_applied.lock().await;
        (latest > 0).then_some(latest)
    }

    /// Run `apply` if `sequence` beats the latest applied one. The lock is held while
    /// applying so two outcomes can never interleave.
    pub async fn apply_if_newer<F, Fut>(&self, sequence: u64, apply: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut latest = self.latest_applied.lock().await;
        if sequence <= *latest {
            return false;
        }
        apply().await;
        *latest = sequence;
        true
    }
}

/// The single logical operation a [`RequestGate`] protects.
#[async_trait]
pub trait GatedOperation: Send + Sync + 'static {
    type Input: AsRef<str> + Clone + Send + Sync + 'static;
    type Output: Send + 'static;

    async fn run(&self, sequence: u64, input: Self::Input) -> Result<Self::Output>;

    /// Called for the newest outcome only, failures included.
    async fn apply(&self, sequence: u64, input: &Self::Input, outcome: Result<Self::Output>);

    /// Called instead of `apply` when the outcome lost to a newer one.
    async fn discard(&self, _sequence: u64, _input: &Self::Input) {}
}

/// Debounce plus staleness suppression around one [`GatedOperation`].
pub struct RequestGate<Op: GatedOperation> {
    inner: Arc<GateInner<Op>>,
}

struct GateInner<Op: GatedOperation> {
    operation: Arc<Op>,
    sequences: SequenceGate,
    debouncer: Debouncer,
    min_trigger_chars: usize,
}

impl<Op: GatedOperation> Clone for RequestGate<Op> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<Op: GatedOperation> RequestGate<Op> {
    pub fn new(operation: Arc<Op>, min_trigger_chars: usize) -> Self {
        Self {
            inner: Arc::new(GateInner {
                operation,
                sequences: SequenceGate::new(),
                debouncer: Debouncer::new(),
                min_trigger_chars,
            }),
        }
    }

    pub fn operation(&self) -> &Arc<Op> {
        &self.inner.operation
    }

    /// Whether a trigger value is long enough to schedule a call.
    pub fn accepts_trigger(&self, value: &Op::Input) -> bool {
        let text = value.as_ref();
        !text.trim().is_empty() && text.chars().count() >= self.inner.min_trigger_chars
    }

    /// Replace any pending invocation with one for `value` after `delay` of quiet.
    /// Returns false when the value is too short, in which case nothing stays pending.
    pub fn schedule(&self, value: Op::Input, delay: Duration) -> bool {
        if !self.accepts_trigger(&value) {
            if self.inner.debouncer.cancel() {
                debug!("Cancelled pending call, trigger value below minimum length");
            }
            return false;
        }

        let gate: Weak<GateInner<Op>> = Arc::downgrade(&self.inner);
        self.inner.debouncer.schedule(delay, async move {
            if let Some(inner) = gate.upgrade() {
                RequestGate { inner }.fire(value).await;
            }
        });
        true
    }

    /// Issue the operation now and apply its outcome if nothing newer got there first.
    pub async fn fire(&self, value: Op::Input) -> GateOutcome {
        if value.as_ref().trim().is_empty() {
            debug!("Skipping gated call for empty input");
            return GateOutcome::Skipped;
        }

        let sequence = self.inner.sequences.issue();
        debug!("Issuing gated call #{}", sequence);
        let outcome = self.inner.operation.run(sequence, value.clone()).await;

        let operation = &self.inner.operation;
        let applied = self
            .inner
            .sequences
            .apply_if_newer(sequence, || operation.apply(sequence, &value, outcome))
            .await;

        if applied {
            GateOutcome::Applied { sequence }
        } else {
            debug!("Discarding stale outcome of call #{}", sequence);
            operation.discard(sequence, &value).await;
            GateOutcome::Stale { sequence }
        }
    }

    pub fn cancel_pending(&self) -> bool {
        self.inner.debouncer.cancel()
    }

    pub fn has_pending(&self) -> bool {
        self.inner.debouncer.is_pending()
    }

    pub fn last_issued(&self) -> u64 {
        self.inner.sequences.last_issued()
    }

    pub async fn latest_applied(&self) -> Option<u64> {
        self.inner.sequences.latest_applied().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sequence_gate_rejects_older_and_equal() {
        let gate = SequenceGate::new();
        let first = gate.issue();
        let second = gate.issue();
        assert_eq!((first, second), (1, 2));
        assert_eq!(gate.latest_applied().await, None);

        assert!(gate.apply_if_newer(second, || async {}).await);
        assert!(!gate.apply_if_newer(first, || async {}).await);
        assert!(!gate.apply_if_newer(second, || async {}).await);
        assert_eq!(gate.latest_applied().await, Some(2));
    }
}
