use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep, timeout};

use crate::api::{FeedError, MarketFeed, SnapshotSource, TickStream};
use crate::execution::engine::TradingEngine;
use crate::models::Candle;
use crate::notify::NotifierHandle;

const SNAPSHOT_RETRY_BASE_MS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Streaming,
}

/// Exponential reconnect delay: `base * 2^attempt`, capped at `max`
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(31));
        let delay = self.base.saturating_mul(factor).min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub symbol: String,
    pub tick_interval: String,
    pub signal_interval: String,
    pub snapshot_count: usize,
    pub snapshot_timeout: Duration,
    pub snapshot_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Longest silence tolerated on the stream before reconnecting
    pub idle_timeout: Duration,
}

#[derive(Clone)]
struct SnapshotRequest {
    source: Arc<dyn SnapshotSource>,
    symbol: String,
    interval: String,
    count: usize,
    /// Shorter windows count as failed attempts
    min_candles: usize,
    timeout: Duration,
    attempts: u32,
}

/// Pause before retry `attempt + 1`: 500ms, 1s, 2s, ...
fn snapshot_retry_delay(attempt: u32) -> Duration {
    let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
    Duration::from_millis(SNAPSHOT_RETRY_BASE_MS.saturating_mul(factor))
}

impl SnapshotRequest {
    /// Fetch with a per-attempt timeout and short exponential pauses in between
    async fn fetch(self) -> Result<Vec<Candle>, FeedError> {
        let mut last_error = String::from("no attempts made");

        for attempt in 1..=self.attempts {
            let result = timeout(
                self.timeout,
                self.source
                    .fetch_candles(&self.symbol, &self.interval, self.count),
            )
            .await;

            match result {
                Ok(Ok(candles)) if candles.len() >= self.min_candles.max(1) => {
                    if attempt > 1 {
                        tracing::info!("Fetched snapshot after {} attempts", attempt);
                    }
                    return Ok(candles);
                }
                Ok(Ok(candles)) => {
                    last_error = format!(
                        "short snapshot: {} candles, need {}",
                        candles.len(),
                        self.min_candles
                    )
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("timed out after {:?}", self.timeout),
            }

            if attempt < self.attempts {
                let delay = snapshot_retry_delay(attempt);
                tracing::warn!(
                    "Snapshot attempt {}/{} failed: {}. Retrying in {:?}...",
                    attempt,
                    self.attempts,
                    last_error,
                    delay
                );
                sleep(delay).await;
            }
        }

        Err(FeedError::Snapshot(last_error))
    }
}

type RefreshTask = JoinHandle<Result<Vec<Candle>, FeedError>>;

/// Owns the connection lifecycle and drives the engine with ticks
///
/// `Disconnected -> Connecting -> Streaming -> Disconnected (on error) ->
/// Connecting (after backoff)`. Every session seeds the signal window from a
/// snapshot before its first tick is processed.
pub struct StreamSupervisor {
    config: SupervisorConfig,
    feed: Arc<dyn MarketFeed>,
    snapshots: Arc<dyn SnapshotSource>,
    engine: TradingEngine,
    notifier: NotifierHandle,
    state: ConnectionState,
    backoff: Backoff,
    stream: Option<TickStream>,
    refresh: Option<RefreshTask>,
    sessions: u64,
}

impl StreamSupervisor {
    pub fn new(
        config: SupervisorConfig,
        feed: Arc<dyn MarketFeed>,
        snapshots: Arc<dyn SnapshotSource>,
        engine: TradingEngine,
        notifier: NotifierHandle,
    ) -> Self {
        let backoff = Backoff::new(config.backoff_base, config.backoff_max);
        Self {
            config,
            feed,
            snapshots,
            engine,
            notifier,
            state: ConnectionState::Connecting,
            backoff,
            stream: None,
            refresh: None,
            sessions: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn engine(&self) -> &TradingEngine {
        &self.engine
    }

    pub fn sessions(&self) -> u64 {
        self.sessions
    }

    /// Run forever; every stream failure is recovered by reconnecting
    pub async fn run(&mut self) {
        loop {
            self.step().await;
        }
    }

    /// Perform one state transition
    pub async fn step(&mut self) {
        self.state = match self.state {
            ConnectionState::Disconnected => {
                let delay = self.backoff.next_delay();
                tracing::info!(
                    attempt = self.backoff.attempts(),
                    "Reconnecting in {:?}",
                    delay
                );
                sleep(delay).await;
                ConnectionState::Connecting
            }
            ConnectionState::Connecting => match self.connect().await {
                Ok(stream) => {
                    self.stream = Some(stream);
                    self.sessions += 1;
                    tracing::info!(
                        symbol = %self.config.symbol,
                        session = self.sessions,
                        candles = self.engine.buffer().len(),
                        "Streaming"
                    );
                    ConnectionState::Streaming
                }
                Err(e) => {
                    tracing::warn!("Connect failed: {}", e);
                    ConnectionState::Disconnected
                }
            },
            ConnectionState::Streaming => {
                let reason = self.stream_session().await;
                tracing::warn!(session = self.sessions, "Stream session ended: {}", reason);
                self.end_session();
                ConnectionState::Disconnected
            }
        };
    }

    /// Subscribe, then seed the window before any tick is consumed
    async fn connect(&mut self) -> Result<TickStream, FeedError> {
        let stream = match timeout(
            self.config.snapshot_timeout,
            self.feed
                .subscribe(&self.config.symbol, &self.config.tick_interval),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(FeedError::Connect(format!(
                    "subscribe timed out after {:?}",
                    self.config.snapshot_timeout
                )))
            }
        };

        match self.snapshot_request().fetch().await {
            Ok(candles) => {
                if let Err(e) = self.engine.rehydrate(candles) {
                    tracing::warn!("Rejected snapshot: {}", e);
                }
            }
            Err(e) if self.engine.is_warm() => {
                tracing::warn!("Snapshot failed, keeping the last window: {}", e);
            }
            Err(e) => return Err(e),
        }

        if !self.engine.is_warm() {
            return Err(FeedError::Snapshot(format!(
                "only {} candles available",
                self.engine.buffer().len()
            )));
        }
        Ok(stream)
    }

    /// Consume ticks until the stream fails; returns why it ended
    async fn stream_session(&mut self) -> FeedError {
        let Some(mut stream) = self.stream.take() else {
            return FeedError::Closed;
        };
        let idle = self.config.idle_timeout;

        loop {
            tokio::select! {
                finished = await_refresh(&mut self.refresh) => {
                    self.refresh = None;
                    self.apply_refresh(finished);
                }
                next = timeout(idle, stream.next()) => {
                    let tick = match next {
                        Ok(Some(Ok(tick))) => tick,
                        Ok(Some(Err(e))) => return e,
                        Ok(None) => return FeedError::Closed,
                        Err(_) => return FeedError::IdleTimeout(idle),
                    };
                    self.backoff.reset();

                    let outcome = self.engine.on_tick(&tick);
                    for event in outcome.events {
                        self.notifier.lifecycle(event);
                    }
                    if outcome.candle_closed || outcome.needs_rehydration {
                        self.schedule_refresh();
                    }
                }
            }
        }
    }

    fn apply_refresh(&mut self, finished: Result<Result<Vec<Candle>, FeedError>, JoinError>) {
        match finished {
            Ok(Ok(candles)) => {
                if let Err(e) = self.engine.rehydrate(candles) {
                    tracing::warn!("Rejected refreshed window: {}", e);
                }
            }
            Ok(Err(e)) => tracing::warn!("Refresh failed, keeping the current window: {}", e),
            Err(e) if e.is_cancelled() => {}
            Err(e) => tracing::error!("Refresh task panicked: {}", e),
        }
    }

    fn schedule_refresh(&mut self) {
        if self.refresh.as_ref().is_some_and(|task| !task.is_finished()) {
            tracing::debug!("Refresh already in flight");
            return;
        }
        self.refresh = Some(tokio::spawn(self.snapshot_request().fetch()));
    }

    fn end_session(&mut self) {
        if let Some(task) = self.refresh.take() {
            task.abort();
        }
        self.stream = None;
    }

    fn snapshot_request(&self) -> SnapshotRequest {
        SnapshotRequest {
            source: Arc::clone(&self.snapshots),
            symbol: self.config.symbol.clone(),
            interval: self.config.signal_interval.clone(),
            count: self.config.snapshot_count,
            min_candles: self.engine.min_window(),
            timeout: self.config.snapshot_timeout,
            attempts: self.config.snapshot_retries.max(1),
        }
    }
}

async fn await_refresh(
    refresh: &mut Option<RefreshTask>,
) -> Result<Result<Vec<Candle>, FeedError>, JoinError> {
    match refresh {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiError;
    use crate::config::Settings;
    use crate::models::Tick;
    use async_trait::async_trait;
    use futures_util::stream;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const MINUTE: i64 = 60_000;
    const SIGNAL: i64 = 15 * MINUTE;
    const CANDLES: usize = 20;

    enum SessionScript {
        /// Emit ticks then end the stream
        Finite(Vec<Result<Tick, FeedError>>),
        /// Emit ticks then stay silent
        Hanging(Vec<Result<Tick, FeedError>>),
        /// Emit ticks, then fail once the delay has passed
        FailsAfter(Vec<Result<Tick, FeedError>>, Duration),
    }

    struct ScriptedFeed {
        sessions: Mutex<VecDeque<SessionScript>>,
        subscriptions: AtomicUsize,
    }

    impl ScriptedFeed {
        fn new(sessions: Vec<SessionScript>) -> Arc<Self> {
            Arc::new(Self {
                sessions: Mutex::new(sessions.into()),
                subscriptions: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl MarketFeed for ScriptedFeed {
        async fn subscribe(&self, _symbol: &str, _interval: &str) -> Result<TickStream, FeedError> {
            self.subscriptions.fetch_add(1, Ordering::SeqCst);
            match self.sessions.lock().unwrap().pop_front() {
                Some(SessionScript::Finite(ticks)) => Ok(stream::iter(ticks).boxed()),
                Some(SessionScript::Hanging(ticks)) => {
                    Ok(stream::iter(ticks).chain(stream::pending()).boxed())
                }
                Some(SessionScript::FailsAfter(ticks, delay)) => Ok(stream::iter(ticks)
                    .chain(stream::once(async move {
                        sleep(delay).await;
                        Err(FeedError::WebSocket("connection reset".into()))
                    }))
                    .boxed()),
                None => Err(FeedError::Connect("no more sessions".into())),
            }
        }
    }

    struct StaticSnapshots {
        calls: AtomicUsize,
        failures_before_success: usize,
        candles: Vec<Candle>,
        delay: Duration,
    }

    impl StaticSnapshots {
        fn new(failures_before_success: usize) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                failures_before_success,
                candles: window(0.0),
                delay: Duration::ZERO,
            })
        }

        /// Always answers with `candles`, after `delay`
        fn serving(candles: Vec<Candle>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                failures_before_success: 0,
                candles,
                delay,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SnapshotSource for StaticSnapshots {
        async fn fetch_candles(
            &self,
            _symbol: &str,
            _interval: &str,
            _count: usize,
        ) -> Result<Vec<Candle>, ApiError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }
            if call < self.failures_before_success {
                return Err(ApiError::Decode("exchange hiccup".into()));
            }
            Ok(self.candles.clone())
        }
    }

    fn window(offset: f64) -> Vec<Candle> {
        (0..CANDLES)
            .map(|i| {
                let price = 100.0 + offset + (i as f64 * 0.7).sin() * 3.0;
                Candle {
                    open_time_ms: i as i64 * SIGNAL,
                    open: price,
                    high: price * 1.002,
                    low: price * 0.998,
                    close: price,
                    volume: 10.0,
                }
            })
            .collect()
    }

    fn forming_open() -> i64 {
        (CANDLES as i64 - 1) * SIGNAL
    }

    fn tick(open_time_ms: i64, price: f64, interval_final: bool) -> Result<Tick, FeedError> {
        Ok(Tick {
            close_price: price,
            interval_final,
            volume: 1.0,
            open_time_ms,
        })
    }

    fn supervisor(feed: Arc<ScriptedFeed>, snapshots: Arc<StaticSnapshots>) -> StreamSupervisor {
        let settings = Settings {
            oscillator_period: 5,
            signal_smoothing_period: 3,
            ..Settings::default()
        };
        let mut config = settings.supervisor();
        config.snapshot_retries = 3;
        config.backoff_base = Duration::from_secs(1);
        config.backoff_max = Duration::from_secs(8);
        config.idle_timeout = Duration::from_secs(30);

        let engine = TradingEngine::new(&settings).unwrap();
        StreamSupervisor::new(config, feed, snapshots, engine, NotifierHandle::detached())
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(8));
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 8, 8]);

        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_snapshot_retry_delay_saturates() {
        assert_eq!(snapshot_retry_delay(1), Duration::from_millis(500));
        assert_eq!(snapshot_retry_delay(2), Duration::from_millis(1000));
        assert_eq!(snapshot_retry_delay(3), Duration::from_millis(2000));
        assert_eq!(snapshot_retry_delay(100), Duration::from_millis(u64::MAX));
        assert_eq!(snapshot_retry_delay(u32::MAX), Duration::from_millis(u64::MAX));
    }

    #[tokio::test(start_paused = true)]
    async fn test_seeds_window_before_streaming() {
        let feed = ScriptedFeed::new(vec![SessionScript::Finite(vec![])]);
        let snapshots = StaticSnapshots::new(0);
        let mut sup = supervisor(feed, snapshots.clone());

        assert_eq!(sup.state(), ConnectionState::Connecting);
        sup.step().await;

        assert_eq!(sup.state(), ConnectionState::Streaming);
        assert_eq!(snapshots.calls(), 1);
        assert!(sup.engine().is_warm());
        assert_eq!(sup.engine().buffer().len(), CANDLES);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_retried_with_backoff() {
        let feed = ScriptedFeed::new(vec![SessionScript::Finite(vec![])]);
        let snapshots = StaticSnapshots::new(2);
        let mut sup = supervisor(feed, snapshots.clone());

        let started = tokio::time::Instant::now();
        sup.step().await;

        assert_eq!(sup.state(), ConnectionState::Streaming);
        assert_eq!(snapshots.calls(), 3);
        // 500ms + 1000ms between the three attempts
        assert!(started.elapsed() >= Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cold_start_fails_when_snapshot_exhausted() {
        let feed = ScriptedFeed::new(vec![SessionScript::Finite(vec![])]);
        let snapshots = StaticSnapshots::new(usize::MAX);
        let mut sup = supervisor(feed, snapshots.clone());

        sup.step().await;

        assert_eq!(sup.state(), ConnectionState::Disconnected);
        assert_eq!(snapshots.calls(), 3);
        assert!(!sup.engine().is_warm());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_stream_error() {
        let forming = forming_open();
        let feed = ScriptedFeed::new(vec![
            SessionScript::Finite(vec![
                tick(forming, 101.0, false),
                Err(FeedError::WebSocket("reset by peer".into())),
            ]),
            SessionScript::Finite(vec![tick(forming + MINUTE, 101.5, false)]),
        ]);
        let snapshots = StaticSnapshots::new(0);
        let mut sup = supervisor(feed.clone(), snapshots.clone());

        sup.step().await; // connect
        sup.step().await; // stream until the error
        assert_eq!(sup.state(), ConnectionState::Disconnected);

        let started = tokio::time::Instant::now();
        sup.step().await; // backoff
        assert_eq!(started.elapsed(), Duration::from_secs(1));
        assert_eq!(sup.state(), ConnectionState::Connecting);

        sup.step().await; // reconnect, window refreshed
        assert_eq!(sup.state(), ConnectionState::Streaming);
        assert_eq!(sup.sessions(), 2);
        assert_eq!(snapshots.calls(), 2);
        assert_eq!(feed.subscriptions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_grows_without_ticks_and_resets_on_tick() {
        let forming = forming_open();
        let feed = ScriptedFeed::new(vec![
            SessionScript::Finite(vec![]),
            SessionScript::Finite(vec![]),
            SessionScript::Finite(vec![tick(forming, 100.5, false)]),
        ]);
        let mut sup = supervisor(feed, StaticSnapshots::new(0));

        sup.step().await; // connect 1
        sup.step().await; // empty session
        sup.step().await; // wait 1s
        sup.step().await; // connect 2
        sup.step().await; // empty session

        let started = tokio::time::Instant::now();
        sup.step().await; // wait 2s
        assert_eq!(started.elapsed(), Duration::from_secs(2));

        sup.step().await; // connect 3
        sup.step().await; // one tick resets the backoff
        assert_eq!(sup.backoff.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_candle_close_triggers_refresh() {
        let forming = forming_open();
        let feed = ScriptedFeed::new(vec![SessionScript::Hanging(vec![
            tick(forming + 5 * MINUTE, 101.0, false),
            tick(forming + 14 * MINUTE, 101.2, true),
        ])]);
        let snapshots = StaticSnapshots::new(0);
        let mut sup = supervisor(feed, snapshots.clone());

        sup.step().await;
        let generation = sup.engine().buffer().generation();

        // Ends on the idle timeout, after the refresh had time to land
        sup.step().await;

        assert_eq!(sup.state(), ConnectionState::Disconnected);
        assert_eq!(snapshots.calls(), 2);
        assert_eq!(sup.engine().buffer().generation(), generation + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keeps_window_when_refresh_fails_on_reconnect() {
        let feed = ScriptedFeed::new(vec![
            SessionScript::Finite(vec![]),
            SessionScript::Finite(vec![]),
        ]);
        let mut sup = supervisor(feed, StaticSnapshots::new(0));
        sup.step().await;
        assert!(sup.engine().is_warm());

        // Every later fetch fails
        let failing = StaticSnapshots::new(usize::MAX);
        sup.snapshots = failing.clone() as Arc<dyn SnapshotSource>;
        sup.step().await; // session ends
        sup.step().await; // backoff
        sup.step().await; // reconnect with failing snapshots

        assert_eq!(sup.state(), ConnectionState::Streaming);
        assert_eq!(failing.calls(), 3);
        assert_eq!(sup.engine().buffer().len(), CANDLES);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_refresh_is_retried_and_keeps_window() {
        let feed = ScriptedFeed::new(vec![SessionScript::Finite(vec![])]);
        let mut sup = supervisor(feed, StaticSnapshots::new(0));
        sup.step().await;
        assert!(sup.engine().is_warm());
        let generation = sup.engine().buffer().generation();

        let short = StaticSnapshots::serving(window(0.0)[..3].to_vec(), Duration::ZERO);
        sup.snapshots = short.clone() as Arc<dyn SnapshotSource>;
        sup.schedule_refresh();
        let finished = await_refresh(&mut sup.refresh).await;
        sup.refresh = None;

        assert!(matches!(finished, Ok(Err(FeedError::Snapshot(_)))));
        sup.apply_refresh(finished);

        assert_eq!(short.calls(), 3);
        assert!(sup.engine().is_warm());
        assert_eq!(sup.engine().buffer().len(), CANDLES);
        assert_eq!(sup.engine().buffer().generation(), generation);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_snapshot_fails_cold_connect() {
        let feed = ScriptedFeed::new(vec![SessionScript::Finite(vec![])]);
        let short = StaticSnapshots::serving(window(0.0)[..3].to_vec(), Duration::ZERO);
        let mut sup = supervisor(feed, StaticSnapshots::new(0));
        sup.snapshots = short.clone() as Arc<dyn SnapshotSource>;

        sup.step().await;

        assert_eq!(sup.state(), ConnectionState::Disconnected);
        assert_eq!(short.calls(), 3);
        assert_eq!(sup.engine().buffer().len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_from_ended_session_is_abandoned() {
        let forming = forming_open();
        let feed = ScriptedFeed::new(vec![
            SessionScript::FailsAfter(
                vec![tick(forming + 14 * MINUTE, 101.2, true)],
                Duration::from_secs(5),
            ),
            SessionScript::Hanging(vec![]),
        ]);
        let mut sup = supervisor(feed, StaticSnapshots::new(0));
        sup.step().await; // connect on the first window

        // The candle close starts a refresh that outlives the session
        let stale = StaticSnapshots::serving(window(50.0), Duration::from_secs(10));
        sup.snapshots = stale.clone() as Arc<dyn SnapshotSource>;
        sup.step().await; // session fails at 5s, refresh still sleeping
        assert_eq!(sup.state(), ConnectionState::Disconnected);
        assert_eq!(stale.calls(), 1);

        let fresh_window = window(10.0);
        sup.snapshots = StaticSnapshots::serving(fresh_window.clone(), Duration::ZERO)
            as Arc<dyn SnapshotSource>;
        sup.step().await; // backoff
        sup.step().await; // reconnect on the new window
        assert_eq!(sup.state(), ConnectionState::Streaming);
        let generation = sup.engine().buffer().generation();

        // Idle for 30s, well past the moment the stale fetch would have finished
        sup.step().await;

        assert_eq!(sup.state(), ConnectionState::Disconnected);
        assert_eq!(sup.engine().buffer().generation(), generation);
        assert_eq!(sup.engine().buffer().candles(), fresh_window);
    }
}
