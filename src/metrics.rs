use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::breaker::BreakerState;
use reconciler_exchange::OrderStatus;

/// In-process counters shared by every breaker and the reconciliation worker.
///
/// Readers only ever see [`MetricsSnapshot`]s; increments are crate-private.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    total_calls: AtomicU64,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    rejected_calls: AtomicU64,
    transitions_to_closed: AtomicU64,
    transitions_to_open: AtomicU64,
    transitions_to_half_open: AtomicU64,
    cycles_completed: AtomicU64,
    failed_cycles: AtomicU64,
    reconciled_orders: AtomicU64,
    discrepancies_found: AtomicU64,
    order_errors: AtomicU64,
    circuit_rejected_orders: AtomicU64,
    last_cycle: Mutex<Option<LastCycle>>,
    status_transitions: Mutex<BTreeMap<String, u64>>,
}

#[derive(Debug, Clone, Copy)]
struct LastCycle {
    started_at: DateTime<Utc>,
    duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StateTransitionCounts {
    pub closed: u64,
    pub open: u64,
    pub half_open: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub state_transitions: StateTransitionCounts,
    pub cycles_completed: u64,
    /// Cycles that could not load their batch of stale orders.
    pub failed_cycles: u64,
    /// When the most recent completed cycle started.
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_cycle_duration_ms: Option<u64>,
    pub reconciled_orders: u64,
    pub discrepancies_found: u64,
    pub order_errors: u64,
    pub circuit_rejected_orders: u64,
    /// Keyed by `"old->new"` canonical status pair.
    pub status_transitions: BTreeMap<String, u64>,
}

fn recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_call(&self) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_success(&self) {
        self.successful_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failed_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.rejected_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_state_transition(&self, to: BreakerState) {
        let counter = match to {
            BreakerState::Closed => &self.transitions_to_closed,
            BreakerState::Open => &self.transitions_to_open,
            BreakerState::HalfOpen => &self.transitions_to_half_open,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reconciled(&self) {
        self.reconciled_orders.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_discrepancy(&self) {
        self.discrepancies_found.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_order_error(&self) {
        self.order_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_circuit_rejected_order(&self) {
        self.circuit_rejected_orders.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_status_transition(&self, from: OrderStatus, to: OrderStatus) {
        *recover(&self.status_transitions)
            .entry(format!("{from}->{to}"))
            .or_insert(0) += 1;
    }

    pub(crate) fn record_cycle(&self, started_at: DateTime<Utc>, duration: Duration) {
        self.cycles_completed.fetch_add(1, Ordering::Relaxed);
        *recover(&self.last_cycle) = Some(LastCycle {
            started_at,
            duration,
        });
    }

    pub(crate) fn record_failed_cycle(&self) {
        self.failed_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let last_cycle = *recover(&self.last_cycle);

        MetricsSnapshot {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            successful_calls: self.successful_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
            state_transitions: StateTransitionCounts {
                closed: self.transitions_to_closed.load(Ordering::Relaxed),
                open: self.transitions_to_open.load(Ordering::Relaxed),
                half_open: self.transitions_to_half_open.load(Ordering::Relaxed),
            },
            cycles_completed: self.cycles_completed.load(Ordering::Relaxed),
            failed_cycles: self.failed_cycles.load(Ordering::Relaxed),
            last_cycle_at: last_cycle.map(|cycle| cycle.started_at),
            last_cycle_duration_ms: last_cycle.map(|cycle| duration_ms(cycle.duration)),
            reconciled_orders: self.reconciled_orders.load(Ordering::Relaxed),
            discrepancies_found: self.discrepancies_found.load(Ordering::Relaxed),
            order_errors: self.order_errors.load(Ordering::Relaxed),
            circuit_rejected_orders: self.circuit_rejected_orders.load(Ordering::Relaxed),
            status_transitions: recover(&self.status_transitions).clone(),
        }
    }
}
