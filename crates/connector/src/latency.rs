//! Rolling latency aggregation and SLA scoring.
//!
//! Pipeline stages push samples with [`LatencyAggregator::record_sample`]. A
//! fixed tick folds the latest samples into a [`MetricsSnapshot`], appends it
//! to a bounded history and notifies subscribers.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tickstream_metadata::MetricsConfig;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::clock::epoch_millis;
use crate::metrics;
use crate::types::{LatencySample, LatencyStage, MetricsSnapshot, SystemStatus};

/// Compliance at exactly 1.5x the target
const KNEE_PERCENT: f64 = 85.0;

/// Score `total_ms` against `target_ms`.
///
/// 100 up to the target, linear down to 85 at 1.5x, then linear down to 0 at 3x.
pub fn sla_compliance(total_ms: f64, target_ms: f64) -> f64 {
    if total_ms <= target_ms {
        return 100.0;
    }
    let knee = target_ms * 1.5;
    if total_ms <= knee {
        let over = (total_ms - target_ms) / (knee - target_ms);
        return 100.0 - (100.0 - KNEE_PERCENT) * over;
    }
    let floor = target_ms * 3.0;
    if total_ms < floor {
        let over = (total_ms - knee) / (floor - knee);
        return KNEE_PERCENT * (1.0 - over);
    }
    0.0
}

pub fn system_status(total_ms: f64, optimal_below_ms: f64, stable_below_ms: f64) -> SystemStatus {
    if total_ms < optimal_below_ms {
        SystemStatus::Optimal
    } else if total_ms < stable_below_ms {
        SystemStatus::Stable
    } else {
        SystemStatus::Degraded
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Rising,
    Falling,
    Flat,
}

pub type SnapshotCallback = Arc<dyn Fn(&MetricsSnapshot) + Send + Sync>;

#[derive(Default)]
struct Window {
    decode: Option<f64>,
    cache_write: Option<f64>,
    dispatch: Option<f64>,
    round_trip: Option<f64>,
    /// Samples since the last tick
    fresh_samples: u64,
    /// Decoded messages since the last tick
    messages: u64,
}

struct State {
    window: Window,
    ema: Option<f64>,
    last_tick: Instant,
    current: MetricsSnapshot,
    history: VecDeque<MetricsSnapshot>,
}

struct AggregatorInner {
    config: MetricsConfig,
    state: Mutex<State>,
    subscribers: RwLock<Vec<(u64, SnapshotCallback)>>,
    next_subscriber: AtomicU64,
}

/// Handle returned by [`LatencyAggregator::subscribe`]
pub struct SnapshotSubscription {
    inner: Weak<AggregatorInner>,
    id: u64,
    done: AtomicBool,
}

impl SnapshotSubscription {
    pub fn unsubscribe(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(inner) = self.inner.upgrade() {
            inner.subscribers.write().retain(|(id, _)| *id != self.id);
        }
    }
}

#[derive(Clone)]
pub struct LatencyAggregator {
    inner: Arc<AggregatorInner>,
}

impl LatencyAggregator {
    pub fn new(config: MetricsConfig) -> Self {
        let capacity = config.history_len;
        Self {
            inner: Arc::new(AggregatorInner {
                config,
                state: Mutex::new(State {
                    window: Window::default(),
                    ema: None,
                    last_tick: Instant::now(),
                    current: empty_snapshot(),
                    history: VecDeque::with_capacity(capacity),
                }),
                subscribers: RwLock::new(Vec::new()),
                next_subscriber: AtomicU64::new(1),
            }),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.inner.config.tick_ms)
    }

    pub fn record_sample(&self, stage: LatencyStage, duration_ms: f64) {
        if !duration_ms.is_finite() || duration_ms < 0.0 {
            return;
        }
        metrics::observe_stage(stage, duration_ms);
        let mut state = self.inner.state.lock();
        let window = &mut state.window;
        window.fresh_samples += 1;
        match stage {
            LatencyStage::Decode => {
                window.decode = Some(duration_ms);
                window.messages += 1;
            }
            LatencyStage::CacheWrite => window.cache_write = Some(duration_ms),
            LatencyStage::Dispatch => window.dispatch = Some(duration_ms),
            LatencyStage::RoundTrip => window.round_trip = Some(duration_ms),
        }
    }

    pub fn record(&self, sample: LatencySample) {
        self.record_sample(sample.stage, sample.duration_ms);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.state.lock().current.clone()
    }

    /// Oldest first
    pub fn history(&self) -> Vec<MetricsSnapshot> {
        self.inner.state.lock().history.iter().cloned().collect()
    }

    /// Highest `last_latency` in the history
    pub fn peak_latency(&self) -> Option<f64> {
        self.inner
            .state
            .lock()
            .history
            .iter()
            .map(|s| s.last_latency)
            .reduce(f64::max)
    }

    /// Compare the average latency of the newer half of the history with the older half
    pub fn trend(&self) -> Trend {
        let state = self.inner.state.lock();
        let len = state.history.len();
        if len < 2 {
            return Trend::Flat;
        }
        let mid = len / 2;
        let older = state.history.iter().take(mid).map(|s| s.average_latency).sum::<f64>() / mid as f64;
        let newer = state.history.iter().skip(mid).map(|s| s.average_latency).sum::<f64>()
            / (len - mid) as f64;
        let tolerance = older.abs() * 0.05;
        if newer > older + tolerance {
            Trend::Rising
        } else if newer < older - tolerance {
            Trend::Falling
        } else {
            Trend::Flat
        }
    }

    pub fn subscribe(&self, callback: SnapshotCallback) -> SnapshotSubscription {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.write().push((id, callback));
        SnapshotSubscription {
            inner: Arc::downgrade(&self.inner),
            id,
            done: AtomicBool::new(false),
        }
    }

    pub fn tick(&self) -> MetricsSnapshot {
        self.tick_at(Instant::now())
    }

    /// Fold the samples seen since the previous tick into a new snapshot
    pub fn tick_at(&self, now: Instant) -> MetricsSnapshot {
        let config = &self.inner.config;
        let snapshot = {
            let mut state = self.inner.state.lock();
            let window = std::mem::take(&mut state.window);
            let elapsed = now.saturating_duration_since(state.last_tick).as_secs_f64();
            state.last_tick = now;

            let total = window.decode.unwrap_or(0.0)
                + window.cache_write.unwrap_or(0.0)
                + window.dispatch.unwrap_or(0.0);

            let snapshot = if window.fresh_samples == 0 {
                MetricsSnapshot {
                    messages_per_second: 0.0,
                    captured_at: epoch_millis(),
                    ..state.current.clone()
                }
            } else {
                let ema = match state.ema {
                    Some(prev) => config.smoothing * total + (1.0 - config.smoothing) * prev,
                    None => total,
                };
                state.ema = Some(ema);
                MetricsSnapshot {
                    average_latency: ema,
                    last_latency: total,
                    sla_compliance_percent: sla_compliance(total, config.sla_target_ms),
                    messages_per_second: if elapsed > 0.0 {
                        window.messages as f64 / elapsed
                    } else {
                        0.0
                    },
                    system_status: system_status(total, config.optimal_below_ms, config.sla_target_ms),
                    round_trip_ms: window.round_trip.or(state.current.round_trip_ms),
                    captured_at: epoch_millis(),
                }
            };

            if state.history.len() >= config.history_len {
                state.history.pop_front();
            }
            state.history.push_back(snapshot.clone());
            state.current = snapshot.clone();
            snapshot
        };

        metrics::record_snapshot(&snapshot);
        self.notify(&snapshot);
        snapshot
    }

    fn notify(&self, snapshot: &MetricsSnapshot) {
        let callbacks: Vec<SnapshotCallback> = self
            .inner
            .subscribers
            .read()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(snapshot))).is_err() {
                metrics::inc_callback_panic();
                error!("Latency subscriber panicked");
            }
        }
    }

    /// Tick on the configured interval until shutdown
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.tick_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("Latency aggregator stopping");
                        break;
                    }
                }
                now = ticker.tick() => {
                    self.tick_at(now);
                }
            }
        }
    }

    pub fn clear(&self) {
        self.inner.subscribers.write().clear();
        let mut state = self.inner.state.lock();
        state.window = Window::default();
        state.ema = None;
        state.history.clear();
        state.current = empty_snapshot();
    }
}

fn empty_snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        average_latency: 0.0,
        last_latency: 0.0,
        sla_compliance_percent: 100.0,
        messages_per_second: 0.0,
        system_status: SystemStatus::Optimal,
        round_trip_ms: None,
        captured_at: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn aggregator() -> LatencyAggregator {
        LatencyAggregator::new(MetricsConfig::default())
    }

    fn feed(agg: &LatencyAggregator, decode: f64, cache: f64, dispatch: f64) {
        agg.record_sample(LatencyStage::Decode, decode);
        agg.record_sample(LatencyStage::CacheWrite, cache);
        agg.record_sample(LatencyStage::Dispatch, dispatch);
    }

    #[test]
    fn test_sla_scenarios() {
        assert_eq!(sla_compliance(4.0, 5.0), 100.0);
        assert_eq!(sla_compliance(5.0, 5.0), 100.0);

        let mid = sla_compliance(7.5, 5.0);
        assert!((85.0..100.0).contains(&mid), "got {}", mid);

        assert!(sla_compliance(20.0, 5.0) < 85.0);
        assert_eq!(sla_compliance(20.0, 5.0), 0.0);
    }

    #[test]
    fn test_sla_decay_is_continuous() {
        assert!((sla_compliance(6.25, 5.0) - 92.5).abs() < 1e-9);
        assert!((sla_compliance(11.25, 5.0) - 42.5).abs() < 1e-9);
        assert!(sla_compliance(7.6, 5.0) < 85.0);
    }

    #[test]
    fn test_status_thresholds() {
        assert_eq!(system_status(2.9, 3.0, 5.0), SystemStatus::Optimal);
        assert_eq!(system_status(3.0, 3.0, 5.0), SystemStatus::Stable);
        assert_eq!(system_status(4.9, 3.0, 5.0), SystemStatus::Stable);
        assert_eq!(system_status(5.0, 3.0, 5.0), SystemStatus::Degraded);
    }

    #[test]
    fn test_tick_sums_stages_and_smooths() {
        let agg = aggregator();
        let t0 = Instant::now();

        feed(&agg, 1.0, 1.0, 2.0);
        let first = agg.tick_at(t0 + Duration::from_millis(250));
        assert_eq!(first.last_latency, 4.0);
        assert_eq!(first.average_latency, 4.0);
        assert_eq!(first.sla_compliance_percent, 100.0);
        assert_eq!(first.system_status, SystemStatus::Stable);

        feed(&agg, 10.0, 2.0, 2.0);
        let second = agg.tick_at(t0 + Duration::from_millis(500));
        assert_eq!(second.last_latency, 14.0);
        assert!((second.average_latency - 5.0).abs() < 1e-9);
        assert_eq!(second.system_status, SystemStatus::Degraded);
    }

    #[test]
    fn test_messages_per_second() {
        let agg = aggregator();
        let t0 = Instant::now();
        agg.tick_at(t0);
        for _ in 0..10 {
            agg.record_sample(LatencyStage::Decode, 0.1);
        }
        let snap = agg.tick_at(t0 + Duration::from_millis(500));
        assert!((snap.messages_per_second - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_idle_tick_keeps_average() {
        let agg = aggregator();
        let t0 = Instant::now();
        feed(&agg, 1.0, 0.5, 0.5);
        agg.tick_at(t0 + Duration::from_millis(250));
        let idle = agg.tick_at(t0 + Duration::from_millis(500));
        assert_eq!(idle.average_latency, 2.0);
        assert_eq!(idle.messages_per_second, 0.0);
    }

    #[test]
    fn test_history_is_bounded_fifo() {
        let agg = LatencyAggregator::new(MetricsConfig {
            history_len: 3,
            ..Default::default()
        });
        let t0 = Instant::now();
        for i in 1..=5 {
            agg.record_sample(LatencyStage::Decode, i as f64);
            agg.tick_at(t0 + Duration::from_millis(i * 250));
        }
        let history = agg.history();
        assert_eq!(history.len(), 3);
        let lasts: Vec<f64> = history.iter().map(|s| s.last_latency).collect();
        assert_eq!(lasts, vec![3.0, 4.0, 5.0]);
        assert_eq!(agg.peak_latency(), Some(5.0));
    }

    #[test]
    fn test_trend() {
        let agg = LatencyAggregator::new(MetricsConfig {
            smoothing: 1.0,
            ..Default::default()
        });
        assert_eq!(agg.trend(), Trend::Flat);
        let t0 = Instant::now();
        for (i, ms) in [1.0, 1.0, 4.0, 4.0].into_iter().enumerate() {
            agg.record_sample(LatencyStage::Decode, ms);
            agg.tick_at(t0 + Duration::from_millis(i as u64 * 250));
        }
        assert_eq!(agg.trend(), Trend::Rising);
    }

    #[test]
    fn test_round_trip_is_excluded_from_total() {
        let agg = aggregator();
        agg.record_sample(LatencyStage::Decode, 1.0);
        agg.record_sample(LatencyStage::RoundTrip, 80.0);
        let snap = agg.tick();
        assert_eq!(snap.last_latency, 1.0);
        assert_eq!(snap.round_trip_ms, Some(80.0));
    }

    #[test]
    fn test_invalid_samples_are_ignored() {
        let agg = aggregator();
        agg.record_sample(LatencyStage::Decode, f64::NAN);
        agg.record_sample(LatencyStage::Decode, -1.0);
        let snap = agg.tick();
        assert_eq!(snap.last_latency, 0.0);
        assert_eq!(snap.average_latency, 0.0);
    }

    #[test]
    fn test_subscribe_and_unsubscribe() {
        let agg = aggregator();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let sub = agg.subscribe(Arc::new(move |_: &MetricsSnapshot| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        agg.subscribe(Arc::new(|_: &MetricsSnapshot| panic!("subscriber bug")));

        agg.tick();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        sub.unsubscribe();
        sub.unsubscribe();
        agg.tick();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_ticks_until_shutdown() {
        let agg = aggregator();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(agg.clone().run(rx));

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        let ticks = agg.history().len();
        assert!(ticks >= 4, "got {} ticks", ticks);

        tx.send(true).unwrap();
        task.await.unwrap();
    }
}
