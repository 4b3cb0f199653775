use chrono::Utc;
use futures_util::future::join_all;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use reconciler_exchange::Exchange;

use crate::activity::append_activity;
use crate::breaker::BreakerState;
use crate::error::{PersistenceError, ReconcileError};
use crate::guarded::GuardedExchange;
use crate::metrics::MetricsRegistry;
use crate::order::{Order, apply_exchange_state, find_stale_orders, touch_synced};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerConfig {
    pub interval: Duration,
    /// Orders synced more recently than this are skipped.
    pub stale_threshold: chrono::Duration,
    pub batch_size: u32,
    /// Orders reconciled simultaneously within one chunk.
    pub concurrency: usize,
    pub chunk_pause: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(45),
            stale_threshold: chrono::Duration::minutes(5),
            batch_size: 200,
            concurrency: 10,
            chunk_pause: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The venue disagreed and the local record was corrected.
    Updated,
    /// Already converged; only the sync timestamp moved.
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleSummary {
    pub total: usize,
    pub successful: usize,
    pub updated: usize,
    pub errors: usize,
    pub circuit_rejected: usize,
    pub duration: Duration,
    pub breaker_state: BreakerState,
}

/// Periodically pulls stale orders and converges them on the venue's state.
pub struct ReconciliationWorker<E: Exchange> {
    config: ReconcilerConfig,
    pool: SqlitePool,
    exchange: Arc<GuardedExchange<E>>,
    metrics: Arc<MetricsRegistry>,
    cycle_guard: Mutex<()>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<E: Exchange> ReconciliationWorker<E> {
    pub fn new(
        config: ReconcilerConfig,
        pool: SqlitePool,
        exchange: Arc<GuardedExchange<E>>,
        metrics: Arc<MetricsRegistry>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            pool,
            exchange,
            metrics,
            cycle_guard: Mutex::new(()),
            shutdown_rx,
        }
    }

    /// Runs one cycle immediately and then one per interval until shutdown is
    /// signalled. A cycle in progress always completes.
    pub async fn run(mut self) {
        info!(
            "Starting reconciliation worker: interval {:?}, stale after {} min, batch size {}, concurrency {}",
            self.config.interval,
            self.config.stale_threshold.num_minutes(),
            self.config.batch_size,
            self.config.concurrency
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("Received shutdown signal, stopping reconciliation worker");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        error!("Reconciliation cycle failed: {e}");
                    }
                }
            }
        }
    }

    /// Reconciles one batch of stale orders. Returns `None` without doing any
    /// work when another cycle is still running.
    pub async fn run_cycle(&self) -> Result<Option<CycleSummary>, PersistenceError> {
        let Ok(_cycle) = self.cycle_guard.try_lock() else {
            warn!("Reconciliation cycle already in progress, skipping");
            return Ok(None);
        };

        let started = Instant::now();
        let started_at = Utc::now();
        let stale_before = started_at - self.config.stale_threshold;
        let orders = match find_stale_orders(&self.pool, stale_before, self.config.batch_size).await
        {
            Ok(orders) => orders,
            Err(e) => {
                self.metrics.record_failed_cycle();
                return Err(e);
            }
        };

        if orders.is_empty() {
            debug!("No stale orders to reconcile");
        } else {
            info!("Reconciling {} stale orders", orders.len());
        }

        let mut summary = CycleSummary {
            total: orders.len(),
            successful: 0,
            updated: 0,
            errors: 0,
            circuit_rejected: 0,
            duration: Duration::ZERO,
            breaker_state: BreakerState::Closed,
        };

        for (chunk_index, chunk) in orders.chunks(self.config.concurrency.max(1)).enumerate() {
            if chunk_index > 0 && !self.config.chunk_pause.is_zero() {
                tokio::time::sleep(self.config.chunk_pause).await;
            }

            let results = join_all(chunk.iter().map(|order| self.reconcile_order(order))).await;

            for (order, result) in chunk.iter().zip(results) {
                self.tally(&mut summary, order, result);
            }
        }

        summary.duration = started.elapsed();
        summary.breaker_state = self.exchange.get_order_breaker().state();
        self.metrics.record_cycle(started_at, summary.duration);

        info!(
            "Reconciliation cycle complete: total={}, successful={}, updated={}, errors={}, circuit_rejected={}, duration={}ms, breaker={}",
            summary.total,
            summary.successful,
            summary.updated,
            summary.errors,
            summary.circuit_rejected,
            summary.duration.as_millis(),
            summary.breaker_state
        );

        Ok(Some(summary))
    }

    fn tally(
        &self,
        summary: &mut CycleSummary,
        order: &Order,
        result: Result<ReconcileOutcome, ReconcileError>,
    ) {
        match result {
            Ok(outcome) => {
                summary.successful += 1;
                if outcome == ReconcileOutcome::Updated {
                    summary.updated += 1;
                }
                self.metrics.record_reconciled();
            }
            Err(e) if e.is_breaker_signal() => {
                summary.circuit_rejected += 1;
                self.metrics.record_circuit_rejected_order();
                debug!("Skipped order {} while the breaker is rejecting: {e}", order.id);
            }
            Err(e) => {
                summary.errors += 1;
                self.metrics.record_order_error();
                error!("Failed to reconcile order {}: {e}", order.id);
            }
        }
    }

    /// Fetches the venue's view of `order` and makes the local record match it.
    pub async fn reconcile_order(&self, order: &Order) -> Result<ReconcileOutcome, ReconcileError> {
        let external_order_id = order
            .external_order_id
            .as_deref()
            .ok_or(ReconcileError::NotSubmitted(order.id))?;

        let remote = self
            .exchange
            .get_order(external_order_id, &order.symbol)
            .await?;

        if remote.executed_qty > order.quantity {
            return Err(ReconcileError::FillExceedsQuantity {
                order_id: order.id,
                executed_qty: remote.executed_qty,
                quantity: order.quantity,
            });
        }

        let price_changed = remote
            .avg_price
            .is_some_and(|price| order.avg_price != Some(price));
        let changed = remote.status != order.status
            || remote.executed_qty != order.filled_quantity
            || price_changed;

        let now = Utc::now();

        if !changed {
            touch_synced(&self.pool, order.id, now).await?;
            debug!("Order {} ({external_order_id}) already in sync", order.id);
            return Ok(ReconcileOutcome::Unchanged);
        }

        let mut sql_tx = self.pool.begin().await.map_err(PersistenceError::from)?;
        let updated = apply_exchange_state(
            &mut sql_tx,
            order.id,
            remote.status,
            remote.executed_qty,
            remote.avg_price,
            now,
        )
        .await?;
        append_activity(
            &mut sql_tx,
            order.id,
            order.status,
            updated.status,
            &remote.raw,
            now,
        )
        .await?;
        sql_tx.commit().await.map_err(PersistenceError::from)?;

        self.metrics.record_discrepancy();
        if order.status != updated.status {
            self.metrics
                .record_status_transition(order.status, updated.status);
        }

        info!(
            "Order {} ({external_order_id}) corrected from exchange: status {} -> {}, filled {} -> {}",
            order.id, order.status, updated.status, order.filled_quantity, updated.filled_quantity
        );

        Ok(ReconcileOutcome::Updated)
    }
}
