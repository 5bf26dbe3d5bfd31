// src/resilience/breaker.rs
//! Per-source circuit breaker. Tracks consecutive failures, short-circuits
//! calls to unhealthy sources, and lets a single probe through after the
//! recovery timeout. State changes log exactly once; steady-state failure
//! does not re-log.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use metrics::counter;
use serde::Serialize;
use tracing::{info, warn};

use crate::model::SourceName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    /// Failing but still allowed through; a heads-up tier before opening.
    Degraded,
    /// Short-circuiting; no traffic reaches the source.
    Open,
    /// Recovery window reached; exactly one probe call is allowed.
    HalfOpen,
}

impl BreakerState {
    fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Degraded => "degraded",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

/// Admission decision made before a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admit {
    Allow,
    /// Allowed, but this call is the recovery probe.
    Probe,
    ShortCircuit,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub degraded_threshold: u32,
    pub open_threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            degraded_threshold: 3,
            open_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    last_failure_time: Option<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    source: SourceName,
    cfg: BreakerConfig,
    inner: Mutex<Inner>,
}

/// Read-only view for the debug endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub source: SourceName,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub seconds_since_last_failure: Option<u64>,
}

impl CircuitBreaker {
    pub fn new(source: SourceName, cfg: BreakerConfig) -> Self {
        Self {
            source,
            cfg,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                last_failure_time: None,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Decide whether a call may proceed. May transition Open -> HalfOpen
    /// when the recovery timeout has elapsed.
    pub fn preflight(&self) -> Admit {
        let mut g = self.inner.lock().expect("breaker mutex poisoned");
        match g.state {
            BreakerState::Closed | BreakerState::Degraded => Admit::Allow,
            BreakerState::Open => {
                let recovered = g
                    .opened_at
                    .map(|t| t.elapsed() >= self.cfg.recovery_timeout)
                    .unwrap_or(true);
                if recovered {
                    self.transition(&mut g, BreakerState::HalfOpen);
                    g.probe_in_flight = true;
                    Admit::Probe
                } else {
                    Admit::ShortCircuit
                }
            }
            BreakerState::HalfOpen => {
                if g.probe_in_flight {
                    Admit::ShortCircuit
                } else {
                    g.probe_in_flight = true;
                    Admit::Probe
                }
            }
        }
    }

    pub fn on_success(&self) {
        let mut g = self.inner.lock().expect("breaker mutex poisoned");
        g.probe_in_flight = false;
        g.consecutive_failures = 0;
        if g.state != BreakerState::Closed {
            let from = g.state;
            self.transition(&mut g, BreakerState::Closed);
            info!(
                target: "source",
                source = %self.source,
                from = from.as_str(),
                "source recovered"
            );
        }
    }

    pub fn on_failure(&self) {
        let mut g = self.inner.lock().expect("breaker mutex poisoned");
        g.probe_in_flight = false;
        g.consecutive_failures = g.consecutive_failures.saturating_add(1);
        g.last_failure_time = Some(Instant::now());

        let next = match g.state {
            // A failed probe reopens immediately, restarting the recovery clock.
            BreakerState::HalfOpen => BreakerState::Open,
            BreakerState::Open => BreakerState::Open,
            BreakerState::Closed | BreakerState::Degraded => {
                if g.consecutive_failures >= self.cfg.open_threshold {
                    BreakerState::Open
                } else if g.consecutive_failures >= self.cfg.degraded_threshold {
                    BreakerState::Degraded
                } else {
                    g.state
                }
            }
        };

        if next != g.state {
            let failures = g.consecutive_failures;
            self.transition(&mut g, next);
            warn!(
                target: "source",
                source = %self.source,
                state = next.as_str(),
                consecutive_failures = failures,
                "source health degraded"
            );
        }
    }

    fn transition(&self, g: &mut Inner, next: BreakerState) {
        if next == BreakerState::Open {
            g.opened_at = Some(Instant::now());
        }
        if g.state != next {
            counter!(
                "breaker_transitions_total",
                "source" => self.source.code(),
                "to" => next.as_str()
            )
            .increment(1);
        }
        g.state = next;
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker mutex poisoned").state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let g = self.inner.lock().expect("breaker mutex poisoned");
        BreakerSnapshot {
            source: self.source,
            state: g.state,
            consecutive_failures: g.consecutive_failures,
            seconds_since_last_failure: g.last_failure_time.map(|t| t.elapsed().as_secs()),
        }
    }
}

/// One breaker per source, created at boot and never destroyed. Covers every
/// known source so a registry reload cannot leave one without a breaker.
/// Injected into the orchestrator rather than reached through globals.
#[derive(Clone)]
pub struct BreakerRegistry {
    map: Arc<HashMap<SourceName, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(cfg: BreakerConfig) -> Self {
        let map = SourceName::all()
            .into_iter()
            .map(|code| (code, Arc::new(CircuitBreaker::new(code, cfg.clone()))))
            .collect();
        Self { map: Arc::new(map) }
    }

    pub fn get(&self, source: SourceName) -> Option<Arc<CircuitBreaker>> {
        self.map.get(&source).cloned()
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut out: Vec<BreakerSnapshot> = self.map.values().map(|b| b.snapshot()).collect();
        out.sort_by_key(|s| s.source);
        out
    }
}
