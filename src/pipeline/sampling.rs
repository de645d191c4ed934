//! Pose sampling loop
//!
//! Repeatedly pulls the latest frame from the live stream, runs the pose
//! model on it and redraws the overlay. Cycles never overlap: the next tick
//! is only awaited once the previous estimate has resolved.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use super::annotation::{AnnotationRenderer, SharedSurface};
use super::health::PipelineHealth;
use crate::capture::LiveStream;
use crate::error::ModelError;
use crate::pose::{ModelConfig, PoseEstimator};

/// Sampling loop lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingState {
    Stopped,
    /// Model is loading
    Starting,
    Running,
    /// Cancelled, waiting for the in-flight cycle to resolve
    Stopping,
}

impl SamplingState {
    pub fn is_active(&self) -> bool {
        matches!(self, SamplingState::Starting | SamplingState::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub period_ms: u64,
    /// Consecutive estimate failures before pose detection gives up
    pub failure_limit: u32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            period_ms: 100,
            failure_limit: 3,
        }
    }
}

impl SamplingConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms.max(1))
    }
}

/// Reported by a loop task. `generation` identifies the activation.
#[derive(Debug, Clone, PartialEq)]
pub enum SamplingEvent {
    Running { generation: u64 },
    LoadFailed { generation: u64, error: ModelError },
    PoseUnavailable { generation: u64, error: ModelError },
    Stopped { generation: u64 },
}

impl SamplingEvent {
    pub fn generation(&self) -> u64 {
        match self {
            SamplingEvent::Running { generation }
            | SamplingEvent::LoadFailed { generation, .. }
            | SamplingEvent::PoseUnavailable { generation, .. }
            | SamplingEvent::Stopped { generation } => *generation,
        }
    }
}

/// Collaborators shared by every activation
struct LoopContext {
    estimator: Arc<dyn PoseEstimator>,
    model: ModelConfig,
    renderer: Arc<AnnotationRenderer>,
    surface: SharedSurface,
    health: Arc<PipelineHealth>,
    config: SamplingConfig,
}

struct ActiveLoop {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns activation and deactivation of pose sampling.
///
/// At most one loop task is live. A deactivated task may still be finishing
/// its last estimate; that result is discarded and never drawn.
pub struct PoseSamplingLoop {
    context: Arc<LoopContext>,
    events_tx: mpsc::UnboundedSender<SamplingEvent>,
    state: SamplingState,
    generation: u64,
    active: Option<ActiveLoop>,
}

impl PoseSamplingLoop {
    pub fn new(
        estimator: Arc<dyn PoseEstimator>,
        model: ModelConfig,
        renderer: Arc<AnnotationRenderer>,
        surface: SharedSurface,
        health: Arc<PipelineHealth>,
        config: SamplingConfig,
        events_tx: mpsc::UnboundedSender<SamplingEvent>,
    ) -> Self {
        Self {
            context: Arc::new(LoopContext {
                estimator,
                model,
                renderer,
                surface,
                health,
                config,
            }),
            events_tx,
            state: SamplingState::Stopped,
            generation: 0,
            active: None,
        }
    }

    pub fn state(&self) -> SamplingState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Start a new activation reading frames from `source`.
    ///
    /// Returns false when a loop is already starting or running. A loop still
    /// `Stopping` is awaited by the new task before it loads the model.
    pub fn activate(&mut self, source: watch::Receiver<Option<LiveStream>>) -> bool {
        if self.state.is_active() {
            return false;
        }

        let previous = self.active.take().map(|active| active.task);
        self.generation += 1;
        let generation = self.generation;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_loop(
            self.context.clone(),
            generation,
            previous,
            source,
            cancel.clone(),
            self.events_tx.clone(),
        ));

        info!("Pose sampling activated (generation {})", generation);
        self.state = SamplingState::Starting;
        self.active = Some(ActiveLoop { cancel, task });
        true
    }

    /// Cancel the pending tick and clear the overlay.
    ///
    /// An in-flight estimate keeps running until it resolves; the state stays
    /// `Stopping` until the task reports back.
    pub async fn deactivate(&mut self) {
        match self.active.take() {
            Some(active) => {
                active.cancel.cancel();
                if active.task.is_finished() {
                    self.state = SamplingState::Stopped;
                } else {
                    self.state = SamplingState::Stopping;
                    self.active = Some(active);
                }
                info!("Pose sampling deactivated (generation {})", self.generation);
            }
            None => self.state = SamplingState::Stopped,
        }

        self.context.surface.lock().await.clear();
    }

    /// Apply a task report. Reports from superseded activations are dropped.
    pub fn handle_event(&mut self, event: SamplingEvent) -> Option<SamplingEvent> {
        if event.generation() != self.generation {
            debug!("Ignoring stale sampling event {:?}", event);
            return None;
        }

        match &event {
            SamplingEvent::Running { .. } => {
                if self.state == SamplingState::Starting {
                    self.state = SamplingState::Running;
                }
            }
            SamplingEvent::LoadFailed { .. }
            | SamplingEvent::PoseUnavailable { .. }
            | SamplingEvent::Stopped { .. } => {
                self.state = SamplingState::Stopped;
                self.active = None;
            }
        }

        Some(event)
    }
}

impl Drop for PoseSamplingLoop {
    fn drop(&mut self) {
        if let Some(active) = &self.active {
            active.cancel.cancel();
        }
    }
}

async fn run_loop(
    context: Arc<LoopContext>,
    generation: u64,
    previous: Option<JoinHandle<()>>,
    source: watch::Receiver<Option<LiveStream>>,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<SamplingEvent>,
) {
    // The superseded task is already cancelled; wait out its last estimate
    // even if this activation is cancelled too, so the chain never overlaps.
    if let Some(previous) = previous {
        debug!("Waiting for the previous sampling task (generation {})", generation);
        if let Err(err) = previous.await {
            warn!("Previous sampling task failed: {}", err);
        }
    }

    let loaded = tokio::select! {
        _ = cancel.cancelled() => {
            debug!("Pose model load abandoned (generation {})", generation);
            let _ = events.send(SamplingEvent::Stopped { generation });
            return;
        }
        result = context.estimator.load(&context.model) => result,
    };

    let mut model = match loaded {
        Ok(model) => model,
        Err(error) => {
            error!("Pose model load failed: {}", error);
            let _ = events.send(SamplingEvent::LoadFailed { generation, error });
            return;
        }
    };

    info!("Pose model loaded, sampling every {:?}", context.config.period());
    let _ = events.send(SamplingEvent::Running { generation });

    let mut ticker = interval(context.config.period());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut failures = 0u32;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let frame = source
            .borrow()
            .as_ref()
            .and_then(LiveStream::latest_frame);
        let Some(frame) = frame else {
            context.health.record_skipped_cycle();
            continue;
        };

        context.health.record_cycle();
        let result = model.estimate(&frame).await;
        if cancel.is_cancelled() {
            debug!("Discarding estimate finished after deactivation");
            break;
        }

        match result {
            Ok(pose) => {
                failures = 0;
                let mut surface = context.surface.lock().await;
                if cancel.is_cancelled() {
                    break;
                }
                let stats =
                    context
                        .renderer
                        .render(&pose, frame.width(), frame.height(), &mut surface);
                context.health.record_pose();
                debug!(
                    "Frame {}: drew {} keypoints, {} edges",
                    frame.sequence(),
                    stats.keypoints,
                    stats.edges
                );
            }
            Err(err) => {
                failures += 1;
                context.health.record_estimate_failure();
                warn!(
                    "Pose estimate failed ({}/{}): {}",
                    failures, context.config.failure_limit, err
                );

                if failures >= context.config.failure_limit {
                    context.surface.lock().await.clear();
                    let error = ModelError::PoseUnavailable {
                        consecutive_failures: failures,
                    };
                    error!("{}", error);
                    let _ = events.send(SamplingEvent::PoseUnavailable { generation, error });
                    return;
                }
            }
        }
    }

    let _ = events.send(SamplingEvent::Stopped { generation });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CameraBackend, CaptureConfig, LiveHandle, SyntheticCamera};
    use crate::pipeline::annotation::OverlaySurface;
    use crate::pipeline::fakes::{ScriptedEstimator, confident_pose};
    use tokio::time::sleep;

    struct Harness {
        sampler: PoseSamplingLoop,
        events: mpsc::UnboundedReceiver<SamplingEvent>,
        surface: SharedSurface,
        health: Arc<PipelineHealth>,
        source: watch::Receiver<Option<LiveStream>>,
        _camera: LiveHandle,
    }

    impl Harness {
        async fn new(estimator: ScriptedEstimator, camera: SyntheticCamera) -> Self {
            let handle = camera.open(&CaptureConfig::default()).await.unwrap();
            let (_tx, source) = watch::channel(Some(handle.stream()));
            let (events_tx, events) = mpsc::unbounded_channel();
            let surface = OverlaySurface::shared();
            let health = Arc::new(PipelineHealth::new());
            let sampler = PoseSamplingLoop::new(
                Arc::new(estimator),
                ModelConfig::default(),
                Arc::new(AnnotationRenderer::default()),
                surface.clone(),
                health.clone(),
                SamplingConfig::default(),
                events_tx,
            );
            Self {
                sampler,
                events,
                surface,
                health,
                source,
                _camera: handle,
            }
        }

        fn activate(&mut self) -> bool {
            self.sampler.activate(self.source.clone())
        }

        async fn next_event(&mut self) -> SamplingEvent {
            loop {
                let event = self.events.recv().await.unwrap();
                if let Some(event) = self.sampler.handle_event(event) {
                    return event;
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_failures_disable_pose() {
        let estimator = ScriptedEstimator::new().with_results(vec![
            Ok(confident_pose(1280, 720)),
            Err(ModelError::InferenceFailed("a".into())),
            Err(ModelError::InferenceFailed("b".into())),
            Err(ModelError::InferenceFailed("c".into())),
        ]);
        let stats = estimator.stats();
        let mut h = Harness::new(estimator, SyntheticCamera::new()).await;

        assert!(h.activate());
        assert_eq!(h.sampler.state(), SamplingState::Starting);
        assert_eq!(h.next_event().await, SamplingEvent::Running { generation: 1 });
        assert_eq!(h.sampler.state(), SamplingState::Running);

        let event = h.next_event().await;
        assert_eq!(
            event,
            SamplingEvent::PoseUnavailable {
                generation: 1,
                error: ModelError::PoseUnavailable {
                    consecutive_failures: 3
                },
            }
        );
        assert_eq!(h.sampler.state(), SamplingState::Stopped);
        assert!(h.surface.lock().await.is_blank());
        assert_eq!(stats.calls(), 4);
        assert_eq!(h.health.estimate_failures(), 3);
        assert_eq!(h.health.poses_rendered(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let fail = || Err(ModelError::InferenceFailed("blip".into()));
        let estimator = ScriptedEstimator::new().with_results(vec![
            fail(),
            fail(),
            Ok(confident_pose(1280, 720)),
            fail(),
            fail(),
            Ok(confident_pose(1280, 720)),
        ]);
        let stats = estimator.stats();
        let mut h = Harness::new(estimator, SyntheticCamera::new()).await;

        h.activate();
        assert_eq!(h.next_event().await, SamplingEvent::Running { generation: 1 });

        sleep(Duration::from_secs(2)).await;
        assert_eq!(h.sampler.state(), SamplingState::Running);
        assert!(h.events.try_recv().is_err());
        assert!(stats.calls() > 6);
        assert_eq!(stats.loads(), 1);
        assert!(!h.surface.lock().await.is_blank());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycles_never_overlap() {
        let estimator = ScriptedEstimator::new().with_latency(Duration::from_millis(250));
        let stats = estimator.stats();
        let mut h = Harness::new(estimator, SyntheticCamera::new()).await;

        h.activate();
        h.next_event().await;
        sleep(Duration::from_secs(3)).await;

        assert!(stats.calls() >= 5);
        assert_eq!(stats.max_in_flight(), 1);
        // Slow estimates stretch the cadence instead of queuing cycles
        assert!(stats.calls() <= 13);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deactivate_discards_in_flight_result() {
        let estimator = ScriptedEstimator::new().with_latency(Duration::from_millis(500));
        let stats = estimator.stats();
        let mut h = Harness::new(estimator, SyntheticCamera::new()).await;

        h.activate();
        h.next_event().await;
        sleep(Duration::from_millis(200)).await;
        assert_eq!(stats.in_flight(), 1);

        h.sampler.deactivate().await;
        assert_eq!(h.sampler.state(), SamplingState::Stopping);
        assert!(h.surface.lock().await.is_blank());

        assert_eq!(h.next_event().await, SamplingEvent::Stopped { generation: 1 });
        assert_eq!(h.sampler.state(), SamplingState::Stopped);
        assert_eq!(stats.in_flight(), 0);
        assert_eq!(h.health.poses_rendered(), 0);
        assert!(h.surface.lock().await.is_blank());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_loading() {
        let estimator = ScriptedEstimator::new().with_load_delay(Duration::from_secs(5));
        let stats = estimator.stats();
        let mut h = Harness::new(estimator, SyntheticCamera::new()).await;

        h.activate();
        sleep(Duration::from_millis(10)).await;
        h.sampler.deactivate().await;

        assert_eq!(h.next_event().await, SamplingEvent::Stopped { generation: 1 });
        assert_eq!(h.sampler.state(), SamplingState::Stopped);
        assert_eq!(stats.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_failure() {
        let mut h = Harness::new(
            ScriptedEstimator::new().failing_load(),
            SyntheticCamera::new(),
        )
        .await;

        h.activate();
        let event = h.next_event().await;
        assert!(matches!(event, SamplingEvent::LoadFailed { generation: 1, .. }));
        assert_eq!(h.sampler.state(), SamplingState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skips_until_first_frame() {
        let estimator = ScriptedEstimator::new();
        let stats = estimator.stats();
        let camera = SyntheticCamera::new().with_warmup(Duration::from_secs(60));
        let mut h = Harness::new(estimator, camera).await;

        h.activate();
        h.next_event().await;
        sleep(Duration::from_secs(1)).await;

        assert_eq!(stats.calls(), 0);
        assert!(h.health.cycles_skipped() >= 5);
        assert_eq!(h.sampler.state(), SamplingState::Running);
        assert!(h.surface.lock().await.is_blank());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reactivation_ignores_stale_reports() {
        let estimator = ScriptedEstimator::new().with_latency(Duration::from_millis(300));
        let stats = estimator.stats();
        let mut h = Harness::new(estimator, SyntheticCamera::new()).await;

        h.activate();
        h.next_event().await;
        sleep(Duration::from_millis(50)).await;
        h.sampler.deactivate().await;
        assert!(!h.sampler.state().is_active());

        assert_eq!(h.sampler.state(), SamplingState::Stopping);

        // Re-enable while the old cycle is still in flight
        assert!(h.activate());
        assert_eq!(h.sampler.generation(), 2);
        sleep(Duration::from_millis(100)).await;
        assert_eq!(stats.in_flight(), 1);
        assert_eq!(stats.loads(), 1);

        assert_eq!(h.next_event().await, SamplingEvent::Running { generation: 2 });
        assert_eq!(h.sampler.state(), SamplingState::Running);
        assert_eq!(stats.loads(), 2);
        assert!(!h.activate());

        sleep(Duration::from_secs(2)).await;
        assert_eq!(stats.max_in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_toggling_keeps_one_estimate_in_flight() {
        let estimator = ScriptedEstimator::new().with_latency(Duration::from_millis(300));
        let stats = estimator.stats();
        let mut h = Harness::new(estimator, SyntheticCamera::new()).await;

        h.activate();
        h.next_event().await;
        sleep(Duration::from_millis(50)).await;

        for _ in 0..3 {
            h.sampler.deactivate().await;
            assert!(h.activate());
            sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(h.next_event().await, SamplingEvent::Running { generation: 4 });
        sleep(Duration::from_secs(1)).await;
        assert_eq!(stats.max_in_flight(), 1);
        assert!(!h.surface.lock().await.is_blank());
    }
}
