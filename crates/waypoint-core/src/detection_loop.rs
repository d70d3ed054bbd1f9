//! Throttled detection loop over a live frame source.
//!
//! One tokio task per loop. Frames are sampled at most once per
//! `min_interval`, with at most one attempt in flight; anything else is
//! dropped, never queued. Results reach the consumer in tick order over a
//! bounded channel. After a positive detection is delivered, further positive
//! detections are withheld until the consumer calls
//! [`DetectionLoop::acknowledge`].

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;

use crate::config::LoopConfig;
use crate::engine::PlaceRecognitionEngine;
use crate::extractor::ExtractError;
use crate::frame::Frame;
use crate::types::DetectionResult;

/// A live source of frames.
///
/// `next_frame` must be cancel-safe: the loop may drop the future while
/// waiting. `None` means the source has ended.
#[async_trait]
pub trait FrameSource: Send {
    async fn next_frame(&mut self) -> Option<Frame>;
}

/// Producer side of a [`ChannelFrameSource`].
#[derive(Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<Frame>,
    sequence: Arc<AtomicU64>,
}

impl FrameSender {
    /// Offer a frame without waiting. Returns false if the frame was dropped
    /// because the loop is behind or gone.
    pub fn offer(&self, frame: Frame) -> bool {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.tx.try_send(frame.with_sequence(seq)).is_ok()
    }

    /// Send a frame, waiting for buffer space. Returns false once the loop has stopped.
    pub async fn send(&self, frame: Frame) -> bool {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.tx.send(frame.with_sequence(seq)).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Frame source fed through a bounded channel. Yields only the newest
/// buffered frame; older ones are discarded.
pub struct ChannelFrameSource {
    rx: mpsc::Receiver<Frame>,
}

/// Create a frame channel holding at most `capacity` pending frames.
pub fn frame_channel(capacity: usize) -> (FrameSender, ChannelFrameSource) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        FrameSender {
            tx,
            sequence: Arc::new(AtomicU64::new(0)),
        },
        ChannelFrameSource { rx },
    )
}

#[async_trait]
impl FrameSource for ChannelFrameSource {
    async fn next_frame(&mut self) -> Option<Frame> {
        let mut frame = self.rx.recv().await?;
        while let Ok(newer) = self.rx.try_recv() {
            tracing::trace!(stale = frame.sequence(), fresh = newer.sequence(), "stale frame discarded");
            frame = newer;
        }
        Some(frame)
    }
}

/// Where the loop is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum LoopState {
    Idle = 0,
    Sampling = 1,
    Extracting = 2,
    Scoring = 3,
    Stopped = 4,
}

impl LoopState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Sampling,
            2 => Self::Extracting,
            3 => Self::Scoring,
            4 => Self::Stopped,
            _ => Self::Idle,
        }
    }
}

/// Counters since the loop started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoopStats {
    pub frames_seen: u64,
    pub dark_skipped: u64,
    pub throttled: u64,
    pub busy_skipped: u64,
    pub attempts: u64,
    pub failed: u64,
    pub delivered: u64,
    pub suppressed: u64,
    /// Results dropped because the consumer's channel was full.
    pub undeliverable: u64,
}

#[derive(Default)]
struct Counters {
    frames_seen: AtomicU64,
    dark_skipped: AtomicU64,
    throttled: AtomicU64,
    busy_skipped: AtomicU64,
    attempts: AtomicU64,
    failed: AtomicU64,
    delivered: AtomicU64,
    suppressed: AtomicU64,
    undeliverable: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

struct Shared {
    state: AtomicU8,
    awaiting_ack: AtomicBool,
    counters: Counters,
}

impl Shared {
    /// Move to `next` unless the loop has already stopped.
    fn set_state(&self, next: LoopState) {
        let _ = self.state.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
            (cur != LoopState::Stopped as u8).then_some(next as u8)
        });
    }

    fn stats(&self) -> LoopStats {
        let c = &self.counters;
        LoopStats {
            frames_seen: c.frames_seen.load(Ordering::Relaxed),
            dark_skipped: c.dark_skipped.load(Ordering::Relaxed),
            throttled: c.throttled.load(Ordering::Relaxed),
            busy_skipped: c.busy_skipped.load(Ordering::Relaxed),
            attempts: c.attempts.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            suppressed: c.suppressed.load(Ordering::Relaxed),
            undeliverable: c.undeliverable.load(Ordering::Relaxed),
        }
    }
}

/// Handle to a running detection loop. Dropping it stops the loop.
pub struct DetectionLoop {
    shared: Arc<Shared>,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl DetectionLoop {
    /// Start a loop driving `source` through `engine`. Results arrive on the
    /// returned receiver; dropping the receiver stops the loop.
    pub fn spawn<S>(
        engine: PlaceRecognitionEngine,
        source: S,
        config: LoopConfig,
    ) -> (Self, mpsc::Receiver<DetectionResult>)
    where
        S: FrameSource + 'static,
    {
        let (result_tx, result_rx) = mpsc::channel(config.result_capacity.max(1));
        let (stop_tx, stop_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            state: AtomicU8::new(LoopState::Idle as u8),
            awaiting_ack: AtomicBool::new(false),
            counters: Counters::default(),
        });

        let task = tokio::spawn(run_loop(
            engine,
            source,
            config,
            shared.clone(),
            stop_rx,
            result_tx,
        ));

        (
            Self {
                shared,
                stop_tx,
                task,
            },
            result_rx,
        )
    }

    /// The consumer is ready for another positive detection.
    pub fn acknowledge(&self) {
        if self.shared.awaiting_ack.swap(false, Ordering::SeqCst) {
            tracing::debug!("detection acknowledged");
        }
    }

    pub fn awaiting_acknowledgement(&self) -> bool {
        self.shared.awaiting_ack.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> LoopState {
        LoopState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    pub fn stats(&self) -> LoopStats {
        self.shared.stats()
    }

    /// Stop scheduling ticks. An attempt in flight is abandoned and its result ignored.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Wait for the loop task to finish.
    pub async fn join(self) {
        let Self { task, stop_tx, .. } = self;
        if let Err(e) = task.await {
            tracing::error!(error = %e, "detection loop task failed");
        }
        drop(stop_tx);
    }
}

type Attempt = JoinHandle<Option<DetectionResult>>;

async fn wait_attempt(slot: &mut Option<Attempt>) -> Result<Option<DetectionResult>, JoinError> {
    match slot.as_mut() {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

async fn run_loop<S: FrameSource>(
    engine: PlaceRecognitionEngine,
    mut source: S,
    config: LoopConfig,
    shared: Arc<Shared>,
    mut stop_rx: watch::Receiver<bool>,
    results: mpsc::Sender<DetectionResult>,
) {
    tracing::info!(min_interval_ms = config.min_interval.as_millis() as u64, "detection loop started");

    let mut last_sample: Option<Instant> = None;
    let mut in_flight: Option<Attempt> = None;

    loop {
        tokio::select! {
            biased;

            _ = stop_rx.changed() => {
                tracing::info!("detection loop stop requested");
                break;
            }

            outcome = wait_attempt(&mut in_flight), if in_flight.is_some() => {
                in_flight = None;
                shared.set_state(LoopState::Idle);
                match outcome {
                    Ok(Some(result)) => {
                        if !deliver(&shared, &results, result) {
                            tracing::info!("result consumer gone");
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        bump(&shared.counters.failed);
                        tracing::error!(error = %e, "detection attempt panicked");
                    }
                }
            }

            frame = source.next_frame() => {
                let Some(frame) = frame else {
                    tracing::info!("frame source ended");
                    break;
                };
                bump(&shared.counters.frames_seen);

                if config.skip_dark_frames && frame.is_dark(config.dark_fraction) {
                    bump(&shared.counters.dark_skipped);
                    tracing::trace!(seq = frame.sequence(), "dark frame skipped");
                    continue;
                }

                let now = Instant::now();
                if let Some(prev) = last_sample {
                    if now.duration_since(prev) < config.min_interval {
                        bump(&shared.counters.throttled);
                        continue;
                    }
                }

                // An attempt abandoned on timeout can leave its extraction
                // running; no new one starts until it returns.
                if in_flight.is_some() || engine.extraction_busy() {
                    bump(&shared.counters.busy_skipped);
                    tracing::trace!(seq = frame.sequence(), "attempt in flight; frame dropped");
                    continue;
                }

                last_sample = Some(now);
                bump(&shared.counters.attempts);
                shared.set_state(LoopState::Sampling);
                tracing::debug!(seq = frame.sequence(), "detection tick");
                in_flight = Some(tokio::spawn(run_attempt(engine.clone(), frame, shared.clone())));
            }
        }
    }

    shared.state.store(LoopState::Stopped as u8, Ordering::SeqCst);
    if in_flight.is_some() {
        tracing::debug!("abandoning in-flight attempt");
    }
    tracing::info!(stats = ?shared.stats(), "detection loop stopped");
}

async fn run_attempt(
    engine: PlaceRecognitionEngine,
    frame: Frame,
    shared: Arc<Shared>,
) -> Option<DetectionResult> {
    if engine.catalog().is_empty() {
        shared.set_state(LoopState::Scoring);
        return Some(DetectionResult::none());
    }

    shared.set_state(LoopState::Extracting);
    let seq = frame.sequence();
    let embedding = match engine.try_embed(frame).await {
        Ok(embedding) => embedding,
        Err(ExtractError::Busy) => {
            bump(&shared.counters.busy_skipped);
            tracing::trace!(seq, "extractor taken by another caller; tick skipped");
            return None;
        }
        Err(e) => {
            bump(&shared.counters.failed);
            tracing::warn!(seq, error = %e, "extraction failed; tick skipped");
            return None;
        }
    };

    shared.set_state(LoopState::Scoring);
    Some(engine.score(&embedding))
}

/// Hand a result to the consumer. Returns false if the consumer is gone.
fn deliver(shared: &Shared, results: &mpsc::Sender<DetectionResult>, result: DetectionResult) -> bool {
    let detected = result.detected;
    if detected && shared.awaiting_ack.swap(true, Ordering::SeqCst) {
        bump(&shared.counters.suppressed);
        tracing::debug!(place = ?result.place_id, "detection suppressed until acknowledged");
        return true;
    }

    match results.try_send(result) {
        Ok(()) => {
            bump(&shared.counters.delivered);
            if detected {
                tracing::info!("place detected");
            }
            true
        }
        Err(mpsc::error::TrySendError::Full(dropped)) => {
            bump(&shared.counters.undeliverable);
            if dropped.detected {
                shared.awaiting_ack.store(false, Ordering::SeqCst);
            }
            tracing::debug!("result channel full; result dropped");
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::tests::{color_engine, color_engine_with};
    use crate::testing::{solid_frame, FnExtractor};
    use std::time::Duration;

    const BLUE: [u8; 3] = [0, 0, 200];
    const NEAR_BLUE: [u8; 3] = [0, 10, 190];
    const GREEN: [u8; 3] = [0, 200, 0];
    const GREY: [u8; 3] = [200, 200, 200];

    fn config(min_interval: Duration) -> LoopConfig {
        // The solid test colors are too dim for the dark-frame filter.
        LoopConfig {
            min_interval,
            skip_dark_frames: false,
            ..LoopConfig::default()
        }
    }

    async fn eventually(cond: impl Fn() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    async fn ready_engine(extractor: Arc<FnExtractor>) -> PlaceRecognitionEngine {
        let (engine, _) = color_engine(extractor);
        engine.catalog().load_all_places().await.unwrap();
        engine
    }

    #[tokio::test]
    async fn test_detects_and_delivers() {
        let extractor = Arc::new(FnExtractor::color());
        let engine = ready_engine(extractor.clone()).await;
        let calls_after_load = extractor.calls();
        let (frames, source) = frame_channel(2);
        let (lp, mut results) = DetectionLoop::spawn(engine, source, config(Duration::ZERO));

        assert!(frames.send(solid_frame(BLUE)).await);
        let result = results.recv().await.unwrap();
        assert!(result.detected);
        assert_eq!(result.place_id.as_deref(), Some("blue"));
        assert_eq!(extractor.calls(), calls_after_load + 1);
        assert!(lp.awaiting_acknowledgement());

        drop(frames);
        assert!(results.recv().await.is_none());
        assert_eq!(lp.state(), LoopState::Stopped);
        assert_eq!(lp.stats().delivered, 1);
    }

    #[tokio::test]
    async fn test_second_frame_within_interval_is_dropped() {
        let extractor = Arc::new(FnExtractor::color());
        let engine = ready_engine(extractor.clone()).await;
        let baseline = extractor.calls();
        let (frames, source) = frame_channel(2);
        let (lp, mut results) = DetectionLoop::spawn(engine, source, config(Duration::from_secs(10)));

        assert!(frames.send(solid_frame(GREY)).await);
        results.recv().await.unwrap();
        assert!(frames.send(solid_frame(GREY)).await);
        drop(frames);
        assert!(results.recv().await.is_none());

        assert_eq!(extractor.calls() - baseline, 1);
        let stats = lp.stats();
        assert_eq!(stats.frames_seen, 2);
        assert_eq!(stats.throttled, 1);
        assert_eq!(stats.attempts, 1);
    }

    #[tokio::test]
    async fn test_frame_during_attempt_is_dropped() {
        let extractor = Arc::new(FnExtractor::color().with_delay(Duration::from_millis(300)));
        let (engine, _) = color_engine(extractor.clone());
        engine.catalog().load_all_places().await.unwrap();
        let baseline = extractor.calls();
        let (frames, source) = frame_channel(2);
        let (lp, mut results) = DetectionLoop::spawn(engine, source, config(Duration::ZERO));

        assert!(frames.send(solid_frame(GREY)).await);
        eventually(|| lp.state() == LoopState::Extracting).await;
        assert!(frames.send(solid_frame(GREY)).await);
        eventually(|| lp.stats().busy_skipped == 1).await;

        let result = results.recv().await.unwrap();
        assert!(!result.detected);
        assert_eq!(extractor.calls() - baseline, 1);
        assert_eq!(lp.state(), LoopState::Idle);
    }

    #[tokio::test]
    async fn test_detections_suppressed_until_acknowledged() {
        let extractor = Arc::new(FnExtractor::color());
        let engine = ready_engine(extractor).await;
        let (frames, source) = frame_channel(2);
        let (lp, mut results) = DetectionLoop::spawn(engine, source, config(Duration::ZERO));

        assert!(frames.send(solid_frame(BLUE)).await);
        assert!(results.recv().await.unwrap().detected);

        // Another confident match, not yet acknowledged: withheld.
        assert!(frames.send(solid_frame(NEAR_BLUE)).await);
        eventually(|| lp.stats().suppressed == 1).await;
        eventually(|| lp.state() == LoopState::Idle).await;

        // Non-detections still flow.
        assert!(frames.send(solid_frame(GREY)).await);
        let result = results.recv().await.unwrap();
        assert!(!result.detected);

        lp.acknowledge();
        assert!(!lp.awaiting_acknowledgement());
        assert!(frames.send(solid_frame(BLUE)).await);
        let result = results.recv().await.unwrap();
        assert!(result.detected);
        assert_eq!(lp.stats().delivered, 3);
    }

    #[tokio::test]
    async fn test_other_place_suppressed_until_acknowledged() {
        let extractor = Arc::new(FnExtractor::color());
        let engine = ready_engine(extractor).await;
        let (frames, source) = frame_channel(2);
        let (lp, mut results) = DetectionLoop::spawn(engine, source, config(Duration::ZERO));

        assert!(frames.send(solid_frame(BLUE)).await);
        let first = results.recv().await.unwrap();
        assert_eq!(first.place_id.as_deref(), Some("blue"));

        // A confident match of a different place is withheld too.
        assert!(frames.send(solid_frame(GREEN)).await);
        eventually(|| lp.stats().suppressed == 1).await;
        eventually(|| lp.state() == LoopState::Idle).await;
        assert!(results.try_recv().is_err());
        assert_eq!(lp.stats().delivered, 1);

        lp.acknowledge();
        assert!(frames.send(solid_frame(GREEN)).await);
        let second = results.recv().await.unwrap();
        assert!(second.detected);
        assert_eq!(second.place_id.as_deref(), Some("green"));
        assert_eq!(lp.stats().suppressed, 1);
        assert_eq!(lp.stats().delivered, 2);
    }

    #[tokio::test]
    async fn test_hung_extraction_blocks_new_attempts() {
        const STUCK: [u8; 3] = [0, 0, 199];
        let extractor = Arc::new(FnExtractor::color().with_delay_on(STUCK, Duration::from_secs(1)));
        let engine_config = EngineConfig {
            extract_timeout: Some(Duration::from_millis(50)),
            fetch_concurrency: 1,
            ..EngineConfig::default()
        };
        let (engine, _) = color_engine_with(engine_config, extractor.clone());
        engine.catalog().load_all_places().await.unwrap();
        let baseline = extractor.calls();
        let (frames, source) = frame_channel(2);
        let (lp, _results) = DetectionLoop::spawn(engine, source, config(Duration::ZERO));

        for _ in 0..10 {
            assert!(frames.send(solid_frame(STUCK)).await);
            tokio::time::sleep(Duration::from_millis(60)).await;
        }
        eventually(|| lp.stats().frames_seen == 10).await;

        let stats = lp.stats();
        assert_eq!(stats.attempts, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.busy_skipped, 9);
        assert_eq!(extractor.calls() - baseline, 1);
        assert_eq!(extractor.peak(), 1);

        // Once the model returns, ticks run again.
        eventually(|| extractor.running() == 0).await;
        eventually(|| lp.state() == LoopState::Idle).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(frames.send(solid_frame(GREY)).await);
        eventually(|| lp.stats().attempts == 2).await;
    }

    #[tokio::test]
    async fn test_stop_discards_in_flight_result() {
        let extractor = Arc::new(FnExtractor::color().with_delay(Duration::from_millis(300)));
        let (engine, _) = color_engine(extractor);
        engine.catalog().load_all_places().await.unwrap();
        let (frames, source) = frame_channel(2);
        let (lp, mut results) = DetectionLoop::spawn(engine, source, config(Duration::ZERO));

        assert!(frames.send(solid_frame(BLUE)).await);
        eventually(|| lp.state() == LoopState::Extracting).await;
        lp.stop();

        assert!(results.recv().await.is_none());
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(lp.state(), LoopState::Stopped);
        assert_eq!(lp.stats().attempts, 1);
        assert_eq!(lp.stats().delivered, 0);
        lp.join().await;
    }

    #[tokio::test]
    async fn test_empty_catalog_reports_no_match() {
        let extractor = Arc::new(FnExtractor::color());
        let (engine, _) = color_engine(extractor.clone());
        let (frames, source) = frame_channel(2);
        let (_lp, mut results) = DetectionLoop::spawn(engine, source, config(Duration::ZERO));

        assert!(frames.send(solid_frame(BLUE)).await);
        let result = results.recv().await.unwrap();
        assert_eq!(result, DetectionResult::none());
        assert_eq!(extractor.calls(), 0);
    }

    #[tokio::test]
    async fn test_extraction_failure_skips_tick() {
        let extractor = Arc::new(FnExtractor::color());
        let engine = ready_engine(extractor).await;
        let (frames, source) = frame_channel(2);
        let (lp, mut results) = DetectionLoop::spawn(engine, source, config(Duration::ZERO));

        assert!(frames.send(solid_frame([255, 0, 0])).await);
        eventually(|| lp.stats().failed == 1).await;
        eventually(|| lp.state() == LoopState::Idle).await;

        assert!(frames.send(solid_frame(GREY)).await);
        assert!(!results.recv().await.unwrap().detected);
        assert_eq!(lp.stats().delivered, 1);
    }

    #[tokio::test]
    async fn test_dark_frames_skipped() {
        let extractor = Arc::new(FnExtractor::color());
        let engine = ready_engine(extractor).await;
        let (frames, source) = frame_channel(2);
        let config = LoopConfig {
            skip_dark_frames: true,
            ..config(Duration::from_secs(10))
        };
        let (lp, mut results) = DetectionLoop::spawn(engine, source, config);

        assert!(frames.send(solid_frame([0, 0, 0])).await);
        // Dark frames do not consume the sampling interval.
        assert!(frames.send(solid_frame(GREY)).await);
        assert!(!results.recv().await.unwrap().detected);
        assert_eq!(lp.stats().dark_skipped, 1);
        assert_eq!(lp.stats().attempts, 1);
    }

    #[tokio::test]
    async fn test_dropping_receiver_stops_loop() {
        let extractor = Arc::new(FnExtractor::color());
        let engine = ready_engine(extractor).await;
        let (frames, source) = frame_channel(2);
        let (lp, results) = DetectionLoop::spawn(engine, source, config(Duration::ZERO));
        drop(results);

        assert!(frames.send(solid_frame(GREY)).await);
        eventually(|| lp.state() == LoopState::Stopped).await;
        eventually(|| frames.is_closed()).await;
    }

    #[tokio::test]
    async fn test_channel_source_keeps_newest_frame() {
        let (frames, mut source) = frame_channel(4);
        assert!(frames.offer(solid_frame([1, 1, 1])));
        assert!(frames.offer(solid_frame([2, 2, 2])));
        assert!(frames.offer(solid_frame([3, 3, 3])));

        let frame = source.next_frame().await.unwrap();
        assert_eq!(frame.rgb_at(0, 0), [3, 3, 3]);
        assert_eq!(frame.sequence(), 2);

        drop(frames);
        assert!(source.next_frame().await.is_none());
    }
}
