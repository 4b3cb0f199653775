//! Three-state circuit breaker guarding a single kind of remote operation.
//!
//! `Closed` lets calls through and counts failures inside a trailing window.
//! Reaching the threshold trips the breaker `Open`, which rejects every call
//! until the open duration has elapsed. The next call after that moves it to
//! `HalfOpen`, where a bounded number of trial calls decide whether to close again
//! or reopen.
//!
//! All mutable state lives in [`BreakerCore`] behind a mutex that is never held
//! across the guarded operation. Every transition bumps a generation counter so
//! results from calls admitted before the transition cannot move the new state.

use serde::Serialize;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::metrics::MetricsRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

impl Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    /// Trailing window in which failures accumulate while closed.
    pub window: Duration,
    pub open_duration: Duration,
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            window: Duration::from_secs(60),
            open_duration: Duration::from_secs(120),
            half_open_max_calls: 3,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    #[error("Circuit breaker {breaker} is open")]
    Open { breaker: String },
    #[error("Circuit breaker {breaker} is half-open and at its trial call limit")]
    HalfOpenLimitExceeded { breaker: String },
    #[error(transparent)]
    Operation(E),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub success_count: u32,
    pub half_open_calls: u32,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub window_ms: u64,
    pub open_duration_ms: u64,
    pub half_open_max_calls: u32,
    pub ms_since_state_change: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejection {
    Open,
    HalfOpenLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Admission {
    generation: u64,
    /// Holds one of the half-open trial slots.
    trial: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Transition {
    from: BreakerState,
    to: BreakerState,
}

#[derive(Debug)]
struct BreakerCore {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    half_open_calls: u32,
    last_failure: Option<Instant>,
    last_state_change: Instant,
    last_error: Option<String>,
    generation: u64,
}

impl BreakerCore {
    fn new(now: Instant) -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            success_count: 0,
            half_open_calls: 0,
            last_failure: None,
            last_state_change: now,
            last_error: None,
            generation: 0,
        }
    }

    fn transition(&mut self, to: BreakerState, now: Instant) -> Transition {
        let from = self.state;
        self.state = to;
        self.failure_count = 0;
        self.success_count = 0;
        self.half_open_calls = 0;
        self.last_state_change = now;
        self.generation += 1;
        Transition { from, to }
    }

    /// Decides whether a call may proceed, returning the generation it was
    /// admitted under.
    fn admit(
        &mut self,
        config: &BreakerConfig,
        now: Instant,
    ) -> (Result<Admission, Rejection>, Option<Transition>) {
        let mut transition = None;

        if self.state == BreakerState::Open {
            if now.duration_since(self.last_state_change) < config.open_duration {
                return (Err(Rejection::Open), None);
            }
            transition = Some(self.transition(BreakerState::HalfOpen, now));
        }

        let trial = self.state == BreakerState::HalfOpen;
        if trial {
            if self.half_open_calls >= config.half_open_max_calls {
                return (Err(Rejection::HalfOpenLimit), transition);
            }
            self.half_open_calls += 1;
        }

        let admission = Admission {
            generation: self.generation,
            trial,
        };
        (Ok(admission), transition)
    }

    /// Frees the slot of a trial call that ended without an outcome.
    fn release_trial(&mut self, generation: u64) {
        if generation == self.generation && self.state == BreakerState::HalfOpen {
            self.half_open_calls = self.half_open_calls.saturating_sub(1);
        }
    }

    fn on_success(
        &mut self,
        config: &BreakerConfig,
        generation: u64,
        now: Instant,
    ) -> Option<Transition> {
        if generation != self.generation {
            return None;
        }

        match self.state {
            BreakerState::Closed => {
                if self
                    .last_failure
                    .is_some_and(|last| now.duration_since(last) > config.window)
                {
                    self.failure_count = 0;
                }
                None
            }
            BreakerState::HalfOpen => {
                self.half_open_calls = self.half_open_calls.saturating_sub(1);
                self.success_count += 1;
                (self.success_count >= config.success_threshold)
                    .then(|| self.transition(BreakerState::Closed, now))
            }
            BreakerState::Open => None,
        }
    }

    fn on_failure(
        &mut self,
        config: &BreakerConfig,
        generation: u64,
        now: Instant,
        error: String,
    ) -> Option<Transition> {
        if generation != self.generation {
            return None;
        }

        self.last_error = Some(error);

        match self.state {
            BreakerState::Closed => {
                if self
                    .last_failure
                    .is_some_and(|last| now.duration_since(last) > config.window)
                {
                    self.failure_count = 0;
                }
                self.failure_count += 1;
                self.last_failure = Some(now);

                (self.failure_count >= config.failure_threshold)
                    .then(|| self.transition(BreakerState::Open, now))
            }
            BreakerState::HalfOpen => {
                self.last_failure = Some(now);
                Some(self.transition(BreakerState::Open, now))
            }
            BreakerState::Open => None,
        }
    }
}

/// Releases a half-open trial slot if the call is dropped before its outcome
/// is recorded.
struct TrialSlot<'a> {
    core: &'a Mutex<BreakerCore>,
    generation: u64,
    armed: bool,
}

impl TrialSlot<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TrialSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.core
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .release_trial(self.generation);
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    core: Mutex<BreakerCore>,
    metrics: Arc<MetricsRegistry>,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        config: BreakerConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            core: Mutex::new(BreakerCore::new(Instant::now())),
            metrics,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn core(&self) -> MutexGuard<'_, BreakerCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state as last recorded. An expired `Open` only becomes
    /// `HalfOpen` once the next call is attempted.
    pub fn state(&self) -> BreakerState {
        self.core().state
    }

    fn log_transition(&self, transition: Transition) {
        self.metrics.record_state_transition(transition.to);
        info!(
            "Circuit breaker {} transitioned {} -> {}",
            self.name, transition.from, transition.to
        );
    }

    /// Runs `operation` if the breaker admits it. Rejected calls never invoke
    /// `operation`.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.metrics.record_call();

        let (admission, transition) = self.core().admit(&self.config, Instant::now());
        if let Some(transition) = transition {
            self.log_transition(transition);
        }

        let admission = match admission {
            Ok(admission) => admission,
            Err(rejection) => {
                self.metrics.record_rejected();
                debug!("Circuit breaker {} rejected call ({rejection:?})", self.name);
                return Err(match rejection {
                    Rejection::Open => BreakerError::Open {
                        breaker: self.name.clone(),
                    },
                    Rejection::HalfOpenLimit => BreakerError::HalfOpenLimitExceeded {
                        breaker: self.name.clone(),
                    },
                });
            }
        };

        let generation = admission.generation;
        let mut slot = TrialSlot {
            core: &self.core,
            generation,
            armed: admission.trial,
        };
        let result = operation().await;
        slot.disarm();

        match result {
            Ok(value) => {
                self.metrics.record_success();
                let transition = self
                    .core()
                    .on_success(&self.config, generation, Instant::now());
                if let Some(transition) = transition {
                    self.log_transition(transition);
                }
                Ok(value)
            }
            Err(error) => {
                self.metrics.record_failure();
                let transition = self.core().on_failure(
                    &self.config,
                    generation,
                    Instant::now(),
                    error.to_string(),
                );
                if let Some(transition) = transition {
                    if transition.to == BreakerState::Open {
                        warn!(
                            "Circuit breaker {} opened after failure: {error}",
                            self.name
                        );
                    }
                    self.log_transition(transition);
                }
                Err(BreakerError::Operation(error))
            }
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let core = self.core();

        BreakerSnapshot {
            name: self.name.clone(),
            state: core.state,
            failure_count: core.failure_count,
            success_count: core.success_count,
            half_open_calls: core.half_open_calls,
            failure_threshold: self.config.failure_threshold,
            success_threshold: self.config.success_threshold,
            window_ms: duration_ms(self.config.window),
            open_duration_ms: duration_ms(self.config.open_duration),
            half_open_max_calls: self.config.half_open_max_calls,
            ms_since_state_change: duration_ms(core.last_state_change.elapsed()),
            last_error: core.last_error.clone(),
        }
    }

    /// Forces the breaker back to `Closed` with all counters cleared.
    pub fn reset(&self) {
        let transition = {
            let mut core = self.core();
            core.last_failure = None;
            core.last_error = None;
            if core.state == BreakerState::Closed {
                core.failure_count = 0;
                core.success_count = 0;
                None
            } else {
                Some(core.transition(BreakerState::Closed, Instant::now()))
            }
        };

        info!("Circuit breaker {} manually reset", self.name);
        if let Some(transition) = transition {
            self.log_transition(transition);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    fn test_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            window: Duration::from_secs(10),
            open_duration: Duration::from_secs(30),
            half_open_max_calls: 2,
        }
    }

    fn create_breaker(config: BreakerConfig) -> (CircuitBreaker, Arc<MetricsRegistry>) {
        let metrics = Arc::new(MetricsRegistry::new());
        (
            CircuitBreaker::new("test.operation", config, metrics.clone()),
            metrics,
        )
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), BreakerError<String>> {
        breaker
            .execute(|| async { Err::<(), _>("boom".to_string()) })
            .await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<(), BreakerError<String>> {
        breaker.execute(|| async { Ok::<_, String>(()) }).await
    }

    async fn trip(breaker: &CircuitBreaker) {
        for _ in 0..breaker.config().failure_threshold {
            let _ = fail(breaker).await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_failures() {
        let (breaker, _) = create_breaker(test_config());

        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), BreakerState::Closed);

        let result = fail(&breaker).await;
        assert!(matches!(result, Err(BreakerError::Operation(ref e)) if e == "boom"));
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_rejects_without_invoking_operation() {
        let (breaker, metrics) = create_breaker(test_config());
        trip(&breaker).await;
        let invocations = AtomicUsize::new(0);
        let rejected_before = metrics.snapshot().rejected_calls;

        let result = breaker
            .execute(|| async {
                invocations.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await;

        assert!(matches!(
            result,
            Err(BreakerError::Open { ref breaker }) if breaker == "test.operation"
        ));
        assert_eq!(invocations.load(Ordering::SeqCst), 0);
        assert_eq!(metrics.snapshot().rejected_calls, rejected_before + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_opens_after_open_duration() {
        let (breaker, metrics) = create_breaker(test_config());
        trip(&breaker).await;

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(matches!(
            succeed(&breaker).await,
            Err(BreakerError::Open { .. })
        ));

        tokio::time::advance(Duration::from_secs(1)).await;
        // Lazy: nothing changes until a call is attempted.
        assert_eq!(breaker.state(), BreakerState::Open);

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert_eq!(metrics.snapshot().state_transitions.half_open, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closes_after_success_threshold() {
        let (breaker, metrics) = create_breaker(test_config());
        trip(&breaker).await;
        tokio::time::advance(Duration::from_secs(30)).await;

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        succeed(&breaker).await.unwrap();

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, BreakerState::Closed);
        assert_eq!(snapshot.failure_count, 0);
        assert_eq!(snapshot.success_count, 0);
        assert_eq!(snapshot.half_open_calls, 0);
        assert_eq!(metrics.snapshot().state_transitions.closed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_any_half_open_failure_reopens() {
        let (breaker, metrics) = create_breaker(test_config());
        trip(&breaker).await;
        tokio::time::advance(Duration::from_secs(30)).await;

        succeed(&breaker).await.unwrap();
        fail(&breaker).await.unwrap_err();

        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(metrics.snapshot().state_transitions.open, 2);
        assert!(matches!(
            succeed(&breaker).await,
            Err(BreakerError::Open { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_limits_in_flight_trials() {
        let (breaker, _) = create_breaker(test_config());
        trip(&breaker).await;
        tokio::time::advance(Duration::from_secs(30)).await;

        let (release_first, first_gate) = oneshot::channel::<()>();
        let (release_second, second_gate) = oneshot::channel::<()>();

        let trial = |gate: oneshot::Receiver<()>| {
            breaker.execute(move || async move {
                gate.await.map_err(|e| e.to_string())?;
                Ok::<_, String>(())
            })
        };

        let first = trial(first_gate);
        let second = trial(second_gate);
        let third = succeed(&breaker);

        tokio::pin!(first, second);
        // Drive both trial calls until they park on their gates.
        assert!(futures_util::poll!(&mut first).is_pending());
        assert!(futures_util::poll!(&mut second).is_pending());

        assert!(matches!(
            third.await,
            Err(BreakerError::HalfOpenLimitExceeded { .. })
        ));
        assert_eq!(breaker.snapshot().half_open_calls, 2);

        release_first.send(()).unwrap();
        release_second.send(()).unwrap();
        first.await.unwrap();
        second.await.unwrap();

        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_trials_free_their_slots() {
        let (breaker, _) = create_breaker(test_config());
        trip(&breaker).await;
        tokio::time::advance(Duration::from_secs(30)).await;

        for _ in 0..test_config().half_open_max_calls {
            let slow_call = breaker.execute(|| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok::<_, String>(())
            });
            tokio::time::timeout(Duration::from_millis(10), slow_call)
                .await
                .unwrap_err();
        }

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, BreakerState::HalfOpen);
        assert_eq!(snapshot.half_open_calls, 0);

        succeed(&breaker).await.unwrap();
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_trial_does_not_touch_later_generation() {
        let (breaker, _) = create_breaker(test_config());
        trip(&breaker).await;
        tokio::time::advance(Duration::from_secs(30)).await;

        let (_release, gate) = oneshot::channel::<()>();
        let mut abandoned = Box::pin(breaker.execute(move || async move {
            gate.await.map_err(|e| e.to_string())?;
            Ok::<_, String>(())
        }));
        assert!(futures_util::poll!(&mut abandoned).is_pending());

        // A failing trial call reopens, and the next half-open period starts fresh.
        fail(&breaker).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(30)).await;
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.snapshot().half_open_calls, 0);

        let (_release_next, next_gate) = oneshot::channel::<()>();
        let in_flight = breaker.execute(move || async move {
            next_gate.await.map_err(|e| e.to_string())?;
            Ok::<_, String>(())
        });
        tokio::pin!(in_flight);
        assert!(futures_util::poll!(&mut in_flight).is_pending());
        assert_eq!(breaker.snapshot().half_open_calls, 1);

        drop(abandoned);
        assert_eq!(breaker.snapshot().half_open_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_decay() {
        let (breaker, _) = create_breaker(test_config());

        for _ in 0..10 {
            fail(&breaker).await.unwrap_err();
            tokio::time::advance(Duration::from_secs(11)).await;
        }

        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.snapshot().failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failures_only_after_window() {
        let (breaker, _) = create_breaker(test_config());

        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.snapshot().failure_count, 2);

        tokio::time::advance(Duration::from_secs(11)).await;
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.snapshot().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_result_does_not_move_new_state() {
        let (breaker, metrics) = create_breaker(test_config());
        let (release, gate) = oneshot::channel::<()>();

        // Admitted while closed, completes after the breaker has opened.
        let slow = breaker.execute(move || async move {
            gate.await.map_err(|e| e.to_string())?;
            Err::<(), _>("late failure".to_string())
        });
        tokio::pin!(slow);
        assert!(futures_util::poll!(&mut slow).is_pending());

        trip(&breaker).await;
        tokio::time::advance(Duration::from_secs(30)).await;
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        release.send(()).unwrap();
        slow.await.unwrap_err();

        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert_eq!(breaker.snapshot().success_count, 1);
        assert_eq!(metrics.snapshot().failed_calls, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_closes_open_breaker() {
        let (breaker, metrics) = create_breaker(test_config());
        trip(&breaker).await;

        breaker.reset();

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, BreakerState::Closed);
        assert_eq!(snapshot.failure_count, 0);
        assert_eq!(snapshot.last_error, None);
        assert_eq!(metrics.snapshot().state_transitions.closed, 1);
        succeed(&breaker).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_reports_config_and_last_error() {
        let (breaker, _) = create_breaker(test_config());
        fail(&breaker).await.unwrap_err();
        tokio::time::advance(Duration::from_millis(1500)).await;

        let snapshot = breaker.snapshot();

        assert_eq!(snapshot.name, "test.operation");
        assert_eq!(snapshot.failure_count, 1);
        assert_eq!(snapshot.window_ms, 10_000);
        assert_eq!(snapshot.open_duration_ms, 30_000);
        assert_eq!(snapshot.ms_since_state_change, 1500);
        assert_eq!(snapshot.last_error.as_deref(), Some("boom"));
        assert_eq!(
            serde_json::to_value(&snapshot).unwrap()["state"],
            serde_json::json!("CLOSED")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_call_is_counted() {
        let (breaker, metrics) = create_breaker(test_config());
        trip(&breaker).await;
        succeed(&breaker).await.unwrap_err();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_calls, 4);
        assert_eq!(snapshot.failed_calls, 3);
        assert_eq!(snapshot.successful_calls, 0);
        assert_eq!(snapshot.rejected_calls, 1);
        assert_eq!(snapshot.state_transitions.open, 1);
    }

    proptest! {
        #[test]
        fn prop_closed_failures_within_window_open_at_threshold(
            threshold in 1u32..10,
            extra in 0u32..5,
            gap_ms in 0u64..1000,
        ) {
            let config = BreakerConfig {
                failure_threshold: threshold,
                window: Duration::from_secs(1),
                ..BreakerConfig::default()
            };
            let start = Instant::now();
            let mut core = BreakerCore::new(start);

            for i in 0..threshold - 1 {
                let now = start + Duration::from_millis(gap_ms * u64::from(i));
                prop_assert!(core.on_failure(&config, core.generation, now, String::new()).is_none());
            }

            let now = start + Duration::from_millis(gap_ms * u64::from(threshold - 1));
            let transition = core.on_failure(&config, core.generation, now, String::new());
            prop_assert_eq!(
                transition,
                Some(Transition { from: BreakerState::Closed, to: BreakerState::Open })
            );

            for _ in 0..extra {
                let (admission, _) = core.admit(&config, now);
                prop_assert_eq!(admission, Err(Rejection::Open));
            }
        }
    }
}
