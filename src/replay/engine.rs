//! Timed re-publication of a recorded session.
//!
//! # Run lifecycle
//!
//! ```text
//!            start()            end, loop=false
//! Idle ───────────────► Playing ───────────────► Finished
//!  ▲                     │   ▲                       │
//!  │ stop()       pause()│   │start()                │ start() rewinds
//!  │                     ▼   │                       │
//!  └──────────────────── Paused ◄── publish failure  │
//!                                                    ▼
//!                                                 Playing
//! ```
//!
//! The worker is a tokio task that owns nothing but an `Arc` of the session
//! and the shared counters. Callers only read state; they never block on the
//! worker except in [`ReplayEngine::join`].

use statum::{machine, state};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::recording::{load_recording, RecordedMessage, Recording};
use super::ReplayError;
use crate::error::StateError;
use crate::mqtt::{Payload, Publisher};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayState {
    Idle,
    Playing,
    Paused,
    Finished,
    Stopped,
}

impl ReplayState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplayState::Idle => "idle",
            ReplayState::Playing => "playing",
            ReplayState::Paused => "paused",
            ReplayState::Finished => "finished",
            ReplayState::Stopped => "stopped",
        }
    }
}

struct ReplayShared {
    cursor: AtomicUsize,
    published: AtomicU64,
    speed_bits: AtomicU64,
    looping: AtomicBool,
    state: Mutex<ReplayState>,
    last_error: Mutex<Option<String>>,
}

impl ReplayShared {
    fn new() -> Self {
        Self {
            cursor: AtomicUsize::new(0),
            published: AtomicU64::new(0),
            speed_bits: AtomicU64::new(1.0f64.to_bits()),
            looping: AtomicBool::new(false),
            state: Mutex::new(ReplayState::Idle),
            last_error: Mutex::new(None),
        }
    }

    fn speed(&self) -> f64 {
        f64::from_bits(self.speed_bits.load(Ordering::SeqCst))
    }

    fn set_speed(&self, speed: f64) {
        self.speed_bits.store(speed.to_bits(), Ordering::SeqCst);
    }

    fn state(&self) -> ReplayState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ReplayState) {
        let mut current = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != state {
            debug!("Replay {} -> {}", current.as_str(), state.as_str());
            *current = state;
        }
    }

    fn set_error(&self, error: Option<String>) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = error;
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum RunState {
    Prepared,
    Running,
}

#[machine]
struct ReplayRun<S: RunState> {
    session: Arc<Vec<RecordedMessage>>,
    shared: Arc<ReplayShared>,
    publisher: Arc<dyn Publisher>,
    cancel: CancellationToken,
}

impl ReplayRun<Prepared> {
    fn create(
        session: Arc<Vec<RecordedMessage>>,
        shared: Arc<ReplayShared>,
        publisher: Arc<dyn Publisher>,
        cancel: CancellationToken,
    ) -> Self {
        Self::new(session, shared, publisher, cancel)
    }

    fn launch(self) -> ReplayRun<Running> {
        info!(
            "Replaying {} messages from #{} at {}x{}",
            self.session.len(),
            self.shared.cursor.load(Ordering::SeqCst),
            self.shared.speed(),
            if self.shared.looping.load(Ordering::SeqCst) {
                ", looping"
            } else {
                ""
            }
        );
        self.shared.set_state(ReplayState::Playing);
        self.transition()
    }
}

impl ReplayRun<Running> {
    /// Publishes from the cursor until the end, cancellation or a failure.
    ///
    /// The first message of a run and the first after a loop reset go out
    /// without delay. After that each gap is `(t[i] - t[i-1]) / speed`.
    async fn run_to_end(self) {
        let len = self.session.len();
        let mut previous_ts: Option<f64> = None;

        loop {
            let index = self.shared.cursor.load(Ordering::SeqCst);
            if index >= len {
                if self.shared.looping.load(Ordering::SeqCst) {
                    debug!("Replay reached the end, looping");
                    self.shared.cursor.store(0, Ordering::SeqCst);
                    previous_ts = None;
                    continue;
                }
                self.shared.set_state(ReplayState::Finished);
                info!(
                    "Replay finished after {} publishes",
                    self.shared.published.load(Ordering::SeqCst)
                );
                return;
            }

            let message = &self.session[index];
            let delay = previous_ts
                .map(|prev| ((message.ts - prev) / self.shared.speed()).max(0.0))
                .unwrap_or(0.0);
            if delay > 0.0 {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs_f64(delay)) => {}
                }
            } else {
                // Zero gaps never touch the timer; hand the thread back so
                // pause() and other tasks still get to run.
                tokio::task::yield_now().await;
            }
            if self.cancel.is_cancelled() {
                return;
            }

            let payload = Payload::from_text(message.payload.clone());
            let published = tokio::select! {
                _ = self.cancel.cancelled() => return,
                result = self.publisher.publish_awaiting(
                    &message.topic,
                    payload,
                    message.qos,
                    message.retain,
                ) => result,
            };
            match published {
                Ok(_) => {
                    self.shared.published.fetch_add(1, Ordering::SeqCst);
                    self.shared.cursor.store(index + 1, Ordering::SeqCst);
                    previous_ts = Some(message.ts);
                }
                Err(e) => {
                    warn!("Replay paused at #{}: publish to {} failed: {}", index, message.topic, e);
                    self.shared.set_error(Some(e.to_string()));
                    self.shared.set_state(ReplayState::Paused);
                    return;
                }
            }
        }
    }
}

struct Worker {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Replays a loaded session through any [`Publisher`].
pub struct ReplayEngine {
    publisher: Arc<dyn Publisher>,
    session: Option<Arc<Vec<RecordedMessage>>>,
    source: Option<PathBuf>,
    warnings: Vec<String>,
    shared: Arc<ReplayShared>,
    worker: Option<Worker>,
}

impl ReplayEngine {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self {
            publisher,
            session: None,
            source: None,
            warnings: Vec::new(),
            shared: Arc::new(ReplayShared::new()),
            worker: None,
        }
    }

    /// Loads a recording file and rewinds. Loading the same file again
    /// yields the same session.
    pub fn load(&mut self, path: &Path) -> Result<usize, ReplayError> {
        self.ensure_not_playing("load")?;
        let recording = load_recording(path)?;
        self.source = Some(path.to_path_buf());
        Ok(self.install(recording))
    }

    pub fn load_recording(&mut self, recording: Recording) -> Result<usize, ReplayError> {
        self.ensure_not_playing("load")?;
        self.source = Some(recording.source.clone());
        Ok(self.install(recording))
    }

    fn install(&mut self, recording: Recording) -> usize {
        let len = recording.messages.len();
        self.warnings = recording.warnings;
        self.session = Some(Arc::new(recording.messages));
        self.shared.cursor.store(0, Ordering::SeqCst);
        self.shared.published.store(0, Ordering::SeqCst);
        self.shared.set_error(None);
        self.shared.set_state(ReplayState::Idle);
        len
    }

    fn ensure_not_playing(&self, operation: &'static str) -> Result<(), StateError> {
        if self.state() == ReplayState::Playing {
            return Err(StateError::WrongState {
                operation,
                state: ReplayState::Playing.as_str().to_string(),
            });
        }
        Ok(())
    }

    /// Starts publishing from the cursor. Requires a runtime.
    pub async fn start(&mut self, speed: f64, looping: bool) -> Result<(), StateError> {
        validate_speed(speed)?;
        let session = self.session.clone().ok_or(StateError::NotLoaded)?;
        if session.is_empty() {
            return Err(StateError::EmptySession);
        }
        self.ensure_not_playing("start")?;
        self.reap_worker().await;

        if self.shared.cursor.load(Ordering::SeqCst) >= session.len() {
            self.shared.cursor.store(0, Ordering::SeqCst);
        }
        self.shared.set_speed(speed);
        self.shared.looping.store(looping, Ordering::SeqCst);
        self.shared.set_error(None);

        let cancel = CancellationToken::new();
        let run = ReplayRun::create(
            session,
            Arc::clone(&self.shared),
            Arc::clone(&self.publisher),
            cancel.clone(),
        )
        .launch();
        let task = tokio::spawn(run.run_to_end());
        self.worker = Some(Worker { cancel, task });
        Ok(())
    }

    /// Halts after the current message; the cursor stays.
    pub async fn pause(&mut self) {
        if self.halt_worker().await && self.state() == ReplayState::Playing {
            self.shared.set_state(ReplayState::Paused);
            info!("Replay paused at #{}", self.cursor());
        }
    }

    /// Halts and rewinds to the beginning.
    pub async fn stop(&mut self) {
        self.halt_worker().await;
        self.shared.cursor.store(0, Ordering::SeqCst);
        if self.session.is_some() {
            self.shared.set_state(ReplayState::Stopped);
        }
        info!("Replay stopped");
    }

    /// Waits until the current run ends on its own. Returns immediately when
    /// nothing is playing.
    pub async fn join(&mut self) {
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.task.await {
                warn!("Replay worker ended abnormally: {}", e);
            }
        }
    }

    async fn halt_worker(&mut self) -> bool {
        let Some(worker) = self.worker.take() else {
            return false;
        };
        worker.cancel.cancel();
        if let Err(e) = worker.task.await {
            warn!("Replay worker ended abnormally: {}", e);
        }
        true
    }

    async fn reap_worker(&mut self) {
        if self.worker.as_ref().is_some_and(|w| w.task.is_finished()) {
            self.join().await;
        }
    }

    /// Takes effect from the next inter-message gap.
    pub fn set_speed(&self, speed: f64) -> Result<(), StateError> {
        validate_speed(speed)?;
        self.shared.set_speed(speed);
        Ok(())
    }

    pub fn speed(&self) -> f64 {
        self.shared.speed()
    }

    pub fn state(&self) -> ReplayState {
        self.shared.state()
    }

    pub fn cursor(&self) -> usize {
        self.shared.cursor.load(Ordering::SeqCst)
    }

    pub fn session_len(&self) -> usize {
        self.session.as_ref().map_or(0, |s| s.len())
    }

    /// Fraction of the session already published, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        match self.session_len() {
            0 => 0.0,
            len => (self.cursor() as f64 / len as f64).clamp(0.0, 1.0),
        }
    }

    pub fn published_count(&self) -> u64 {
        self.shared.published.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }
}

impl Drop for ReplayEngine {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.cancel.cancel();
        }
    }
}

fn validate_speed(speed: f64) -> Result<(), StateError> {
    if speed.is_finite() && speed > 0.0 {
        Ok(())
    } else {
        Err(StateError::InvalidSpeed(speed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::publisher::testing::MemoryPublisher;
    use crate::mqtt::{PublishId, TransportError};
    use rumqttc::QoS;

    fn session(times: &[f64]) -> Recording {
        Recording::from_messages(
            times
                .iter()
                .enumerate()
                .map(|(i, ts)| RecordedMessage {
                    topic: format!("module/v1/ff/M{}/state", i),
                    payload: format!("{{\"i\":{}}}", i),
                    ts: *ts,
                    qos: QoS::AtLeastOnce,
                    retain: false,
                })
                .collect(),
        )
    }

    fn engine_with(times: &[f64]) -> (ReplayEngine, Arc<MemoryPublisher>) {
        let publisher = Arc::new(MemoryPublisher::new());
        let mut engine = ReplayEngine::new(publisher.clone());
        engine.load_recording(session(times)).unwrap();
        (engine, publisher)
    }

    /// Timer granularity is one millisecond, allow two.
    fn assert_gaps_ms(publisher: &MemoryPublisher, expected: &[u64]) {
        let sent = publisher.sent();
        let gaps: Vec<Duration> = sent.windows(2).map(|w| w[1].at - w[0].at).collect();
        assert_eq!(gaps.len(), expected.len(), "{:?}", gaps);
        for (gap, want) in gaps.iter().zip(expected) {
            let want = Duration::from_millis(*want);
            let diff = if *gap > want { *gap - want } else { want - *gap };
            assert!(diff <= Duration::from_millis(2), "gap {:?}, expected {:?}", gap, want);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn speed_five_compresses_timeline() {
        let (mut engine, publisher) = engine_with(&[0.0, 1.0, 3.0]);
        engine.start(5.0, false).await.unwrap();
        engine.join().await;

        assert_gaps_ms(&publisher, &[200, 400]);
        assert_eq!(engine.state(), ReplayState::Finished);
        assert_eq!(engine.progress(), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn speed_two_halves_intervals() {
        let (mut engine, publisher) = engine_with(&[0.0, 0.1, 0.3]);
        engine.start(2.0, false).await.unwrap();
        engine.join().await;
        assert_gaps_ms(&publisher, &[50, 100]);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_replays_from_start_without_delay() {
        let (mut engine, publisher) = engine_with(&[0.0, 1.0, 2.0]);
        engine.start(1.0, true).await.unwrap();

        while publisher.sent().len() < 6 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        engine.pause().await;

        let sent = publisher.sent();
        let topics: Vec<&str> = sent.iter().take(6).map(|p| p.topic.as_str()).collect();
        assert_eq!(
            topics,
            vec![
                "module/v1/ff/M0/state",
                "module/v1/ff/M1/state",
                "module/v1/ff/M2/state",
                "module/v1/ff/M0/state",
                "module/v1/ff/M1/state",
                "module/v1/ff/M2/state",
            ]
        );
        assert!(sent[3].at - sent[2].at < Duration::from_millis(1));
        assert!(engine.published_count() >= 6);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_publish_pauses_without_advancing() {
        let (mut engine, publisher) = engine_with(&[0.0, 1.0]);
        publisher.set_failing(true);
        engine.start(1.0, false).await.unwrap();
        engine.join().await;

        assert_eq!(engine.state(), ReplayState::Paused);
        assert_eq!(engine.cursor(), 0);
        assert!(engine.last_error().is_some());

        publisher.set_failing(false);
        engine.start(1.0, false).await.unwrap();
        engine.join().await;
        assert_eq!(publisher.sent().len(), 2);
        assert_eq!(engine.state(), ReplayState::Finished);
        assert!(engine.last_error().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_rewinds_and_pause_keeps_cursor() {
        let (mut engine, publisher) = engine_with(&[0.0, 1.0, 2.0, 3.0]);
        engine.start(1.0, false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        engine.pause().await;
        assert_eq!(engine.state(), ReplayState::Paused);
        assert_eq!(engine.cursor(), 2);
        assert_eq!(engine.progress(), 0.5);

        engine.stop().await;
        assert_eq!(engine.cursor(), 0);
        assert_eq!(engine.state(), ReplayState::Stopped);
        assert_eq!(publisher.sent().len(), 2);
    }

    #[tokio::test]
    async fn start_requires_a_loaded_session() {
        let mut engine = ReplayEngine::new(Arc::new(MemoryPublisher::new()));
        assert_eq!(engine.start(1.0, false).await, Err(StateError::NotLoaded));

        engine.load_recording(Recording::default()).unwrap();
        assert_eq!(engine.start(1.0, false).await, Err(StateError::EmptySession));

        let (mut engine, _) = engine_with(&[0.0]);
        assert_eq!(
            engine.start(0.0, false).await,
            Err(StateError::InvalidSpeed(0.0))
        );
        assert!(engine.set_speed(-1.0).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn start_after_finish_rewinds() {
        let (mut engine, publisher) = engine_with(&[0.0, 0.5]);
        engine.start(1.0, false).await.unwrap();
        engine.join().await;
        engine.start(1.0, false).await.unwrap();
        engine.join().await;
        assert_eq!(publisher.sent().len(), 4);
        assert_eq!(engine.published_count(), 4);
    }

    /// Publisher whose awaiting path completes immediately, so the run loop
    /// gets no yield point from it.
    #[derive(Default)]
    struct Counting(AtomicU64);

    impl Publisher for Counting {
        fn publish_message(
            &self,
            _topic: &str,
            _payload: Payload,
            _qos: QoS,
            _retain: bool,
        ) -> Result<PublishId, TransportError> {
            Ok(self.0.fetch_add(1, Ordering::SeqCst) + 1)
        }
    }

    #[tokio::test]
    async fn looping_zero_gap_run_can_be_paused_on_one_thread() {
        let publisher = Arc::new(Counting::default());
        let mut engine = ReplayEngine::new(publisher.clone());
        engine.load_recording(session(&[0.0])).unwrap();
        engine.start(1.0, true).await.unwrap();

        let paused = tokio::time::timeout(Duration::from_secs(3), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            engine.pause().await;
        })
        .await;
        assert!(paused.is_ok());
        assert_eq!(engine.state(), ReplayState::Paused);
        assert!(engine.published_count() > 0);
        assert_eq!(publisher.0.load(Ordering::SeqCst), engine.published_count());
    }

    #[tokio::test(start_paused = true)]
    async fn burst_waits_for_queue_room_instead_of_pausing() {
        let (mut engine, publisher) = engine_with(&[1.0; 150]);
        publisher.set_queue_full(true);
        engine.start(1.0, false).await.unwrap();
        engine.join().await;

        assert_eq!(engine.state(), ReplayState::Finished);
        assert_eq!(engine.last_error(), None);
        assert_eq!(publisher.sent().len(), 150);
        assert_eq!(engine.published_count(), 150);
    }
}
