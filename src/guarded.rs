use std::sync::Arc;

use reconciler_exchange::{
    Balance, CancelAck, Exchange, ExchangeOrder, OrderPlacement, OrderRequest, Symbol,
};

use crate::breaker::{BreakerConfig, BreakerSnapshot, CircuitBreaker};
use crate::error::CallError;
use crate::metrics::MetricsRegistry;
use crate::retry::RetryPolicy;

/// Exchange client with a dedicated circuit breaker per operation, each call
/// wrapped as `retry(breaker(operation))`.
pub struct GuardedExchange<E: Exchange> {
    inner: Arc<E>,
    retry: RetryPolicy,
    get_order_breaker: CircuitBreaker,
    place_order_breaker: CircuitBreaker,
    cancel_order_breaker: CircuitBreaker,
    get_balance_breaker: CircuitBreaker,
}

impl<E: Exchange> GuardedExchange<E> {
    pub fn new(
        inner: Arc<E>,
        breaker_config: &BreakerConfig,
        retry: RetryPolicy,
        metrics: &Arc<MetricsRegistry>,
    ) -> Self {
        let breaker = |operation: &str| {
            CircuitBreaker::new(
                format!("exchange.{operation}"),
                breaker_config.clone(),
                metrics.clone(),
            )
        };

        Self {
            get_order_breaker: breaker("get_order"),
            place_order_breaker: breaker("place_order"),
            cancel_order_breaker: breaker("cancel_order"),
            get_balance_breaker: breaker("get_balance"),
            inner,
            retry,
        }
    }

    pub const fn get_order_breaker(&self) -> &CircuitBreaker {
        &self.get_order_breaker
    }

    pub fn breakers(&self) -> [&CircuitBreaker; 4] {
        [
            &self.get_order_breaker,
            &self.place_order_breaker,
            &self.cancel_order_breaker,
            &self.get_balance_breaker,
        ]
    }

    pub fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers()
            .into_iter()
            .map(CircuitBreaker::snapshot)
            .collect()
    }

    /// Forces every breaker back to closed.
    pub fn reset_breakers(&self) {
        for breaker in self.breakers() {
            breaker.reset();
        }
    }

    pub async fn get_order(
        &self,
        order_id: &str,
        symbol: &Symbol,
    ) -> Result<ExchangeOrder, CallError> {
        self.retry
            .run("get_order", || async {
                self.get_order_breaker
                    .execute(|| self.inner.get_order(order_id, symbol))
                    .await
                    .map_err(CallError::from)
            })
            .await
    }

    pub async fn place_order(&self, request: OrderRequest) -> Result<OrderPlacement, CallError> {
        self.retry
            .run("place_order", || async {
                self.place_order_breaker
                    .execute(|| self.inner.place_order(request.clone()))
                    .await
                    .map_err(CallError::from)
            })
            .await
    }

    pub async fn cancel_order(
        &self,
        order_id: &str,
        symbol: &Symbol,
    ) -> Result<CancelAck, CallError> {
        self.retry
            .run("cancel_order", || async {
                self.cancel_order_breaker
                    .execute(|| self.inner.cancel_order(order_id, symbol))
                    .await
                    .map_err(CallError::from)
            })
            .await
    }

    pub async fn get_balance(&self, asset: Option<&str>) -> Result<Vec<Balance>, CallError> {
        self.retry
            .run("get_balance", || async {
                self.get_balance_breaker
                    .execute(|| self.inner.get_balance(asset))
                    .await
                    .map_err(CallError::from)
            })
            .await
    }
}
