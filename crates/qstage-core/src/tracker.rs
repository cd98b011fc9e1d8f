//! Per-query planning instrumentation.
//!
//! `PlanTracker` is a side channel: it records how long each named phase
//! took and how often each rule ran, and nothing it records is ever read
//! back by planning code.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Phase timing as offsets from tracker creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSummary {
    pub start: Duration,
    pub end: Duration,
}

impl PhaseSummary {
    pub fn duration(&self) -> Duration {
        self.end.saturating_sub(self.start)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSummary {
    pub invocations: u64,
    /// Invocations that changed the plan.
    pub effective_invocations: u64,
    pub total_nanos: u128,
}

#[derive(Debug, Default)]
struct Inner {
    phases: Vec<(String, PhaseSummary)>,
    rules: BTreeMap<String, RuleSummary>,
}

#[derive(Debug)]
pub struct PlanTracker {
    origin: Instant,
    inner: Mutex<Inner>,
}

impl Default for PlanTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PlanTracker {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            inner: Mutex::new(Inner::default()),
        }
    }

    // Recording must keep working after a panicking producer.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` and record its wall-clock span under `phase` if it succeeds.
    /// The first successful measurement of a phase wins; later ones are
    /// ignored.
    pub fn measure_phase<T, F>(&self, phase: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let start = self.origin.elapsed();
        let out = f()?;
        let end = self.origin.elapsed();
        let mut inner = self.lock();
        if !inner.phases.iter().any(|(name, _)| name == phase) {
            inner
                .phases
                .push((phase.to_string(), PhaseSummary { start, end }));
        }
        Ok(out)
    }

    pub fn record_rule(&self, rule: &str, elapsed: Duration, changed: bool) {
        let mut inner = self.lock();
        let entry = inner.rules.entry(rule.to_string()).or_default();
        entry.invocations += 1;
        if changed {
            entry.effective_invocations += 1;
        }
        entry.total_nanos += elapsed.as_nanos();
    }

    /// Snapshot of recorded phases in the order they completed.
    pub fn phases(&self) -> Vec<(String, PhaseSummary)> {
        self.lock().phases.clone()
    }

    pub fn phase(&self, name: &str) -> Option<PhaseSummary> {
        self.lock()
            .phases
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, s)| *s)
    }

    pub fn rules(&self) -> BTreeMap<String, RuleSummary> {
        self.lock().rules.clone()
    }
}
