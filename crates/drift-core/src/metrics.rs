//! Global atomic counters for simulation runs.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at the end of a run).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters, no allocation and no locking.
pub struct Metrics {
    rounds_recorded: AtomicU64,
    agent_invocations: AtomicU64,
    classification_fallbacks: AtomicU64,
    runs_failed: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            rounds_recorded: AtomicU64::new(0),
            agent_invocations: AtomicU64::new(0),
            classification_fallbacks: AtomicU64::new(0),
            runs_failed: AtomicU64::new(0),
        }
    }

    pub fn inc_rounds_recorded(&self) {
        self.rounds_recorded.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "rounds_recorded", "counter incremented");
    }

    /// Counts every call into an agent, reprompts included.
    pub fn inc_agent_invocations(&self) {
        self.agent_invocations.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "agent_invocations", "counter incremented");
    }

    pub fn inc_classification_fallbacks(&self) {
        self.classification_fallbacks.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "classification_fallbacks", "counter incremented");
    }

    pub fn inc_runs_failed(&self) {
        self.runs_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "runs_failed", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    ///
    /// Call this at natural boundaries (end of a run, end of a study)
    /// rather than on every increment.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            rounds_recorded = self.rounds_recorded(),
            agent_invocations = self.agent_invocations(),
            classification_fallbacks = self.classification_fallbacks(),
            runs_failed = self.runs_failed(),
        );
    }

    pub fn rounds_recorded(&self) -> u64 {
        self.rounds_recorded.load(Ordering::Relaxed)
    }

    pub fn agent_invocations(&self) -> u64 {
        self.agent_invocations.load(Ordering::Relaxed)
    }

    pub fn classification_fallbacks(&self) -> u64 {
        self.classification_fallbacks.load(Ordering::Relaxed)
    }

    pub fn runs_failed(&self) -> u64 {
        self.runs_failed.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.rounds_recorded.store(0, Ordering::Relaxed);
        self.agent_invocations.store(0, Ordering::Relaxed);
        self.classification_fallbacks.store(0, Ordering::Relaxed);
        self.runs_failed.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        assert_eq!(m.rounds_recorded(), 0);
        m.inc_rounds_recorded();
        m.inc_rounds_recorded();
        assert_eq!(m.rounds_recorded(), 2);

        m.inc_agent_invocations();
        assert_eq!(m.agent_invocations(), 1);

        m.inc_classification_fallbacks();
        m.inc_runs_failed();
        m.inc_runs_failed();
        assert_eq!(m.classification_fallbacks(), 1);
        assert_eq!(m.runs_failed(), 2);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_rounds_recorded();
        m.inc_agent_invocations();
        m.inc_classification_fallbacks();
        m.inc_runs_failed();
        m.reset();
        assert_eq!(m.rounds_recorded(), 0);
        assert_eq!(m.agent_invocations(), 0);
        assert_eq!(m.classification_fallbacks(), 0);
        assert_eq!(m.runs_failed(), 0);
    }
}
