//! Pipeline controller
//!
//! Single owner of the pipeline state. UI collaborators send
//! [`PipelineEvent`]s through a [`ControllerHandle`]; the controller applies
//! them one at a time to the camera, the pose sampling loop and the recording
//! session, and publishes a [`PipelineStatus`] after every change.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, interval_at};
use tokio_util::sync::CancellationToken;

use super::annotation::{AnnotationRenderer, OverlaySurface, RenderConfig, SharedSurface};
use super::health::PipelineHealth;
use super::recording::{Finalized, RecordingArtifact, RecordingConfig, RecordingSession};
use super::sampling::{PoseSamplingLoop, SamplingConfig, SamplingEvent, SamplingState};
use super::state::PipelineState;
use crate::capture::{CameraBackend, CameraSource, CaptureConfig, LiveStream, Resolution};
use crate::encoder::RecordingEncoder;
use crate::error::{DeviceError, PipelineError, RecordingError, StateError};
use crate::pose::{ModelConfig, PoseEstimator};
use crate::workers::{UploadSink, export_path, save_artifact};

const COMMAND_CHANNEL_CAPACITY: usize = 16;

/// Requests from the UI
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// Open (or reopen) the camera with a full configuration
    Configure(CaptureConfig),
    ChangeResolution(Resolution),
    ChangeFrameRate(u32),
    SwitchCamera,
    TogglePose,
    StartRecording,
    StopRecording,
    /// Discard the recording under review
    Retake,
    /// Save the recording under review; `None` uses the export directory
    Export(Option<PathBuf>),
    Upload,
    Shutdown,
}

/// Successful outcome of an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ack {
    Done,
    /// Camera switch requested with a single device present
    DeviceUnchanged,
    Exported(PathBuf),
    /// Size in bytes of the uploaded blob
    Uploaded(usize),
}

/// Pose detection as seen by the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoseCondition {
    Off,
    Loading,
    Running,
    /// The model failed to load or gave up after repeated failures
    Unavailable,
}

/// Snapshot published after every change
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineStatus {
    pub state: PipelineState,
    /// Live video is decodable
    pub ready: bool,
    pub sampling: SamplingState,
    pub pose: PoseCondition,
    /// Recording stopped, waiting for the encoder's last chunk
    pub finalizing: bool,
    pub capture: CaptureConfig,
    pub artifact: Option<Arc<RecordingArtifact>>,
    pub last_error: Option<PipelineError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Configuration used by the first `Configure`-less open
    pub capture: CaptureConfig,
    pub sampling: SamplingConfig,
    pub model: ModelConfig,
    pub render: RenderConfig,
    pub recording: RecordingConfig,
    pub health_log_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            sampling: SamplingConfig::default(),
            model: ModelConfig::default(),
            render: RenderConfig::default(),
            recording: RecordingConfig::default(),
            health_log_interval: Duration::from_secs(30),
        }
    }
}

/// Backends the controller drives
pub struct Collaborators {
    pub camera: Arc<dyn CameraBackend>,
    pub estimator: Arc<dyn PoseEstimator>,
    pub encoder: Arc<dyn RecordingEncoder>,
    pub upload: Arc<dyn UploadSink>,
}

struct Command {
    event: PipelineEvent,
    reply: oneshot::Sender<Result<Ack, PipelineError>>,
}

/// Cloneable front end of a running controller
#[derive(Clone)]
pub struct ControllerHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<PipelineStatus>,
    surface: SharedSurface,
    health: Arc<PipelineHealth>,
}

impl ControllerHandle {
    /// Deliver `event` and wait until the controller has applied it
    pub async fn send(&self, event: PipelineEvent) -> Result<Ack, PipelineError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command { event, reply })
            .await
            .map_err(|_| PipelineError::Closed)?;
        response.await.map_err(|_| PipelineError::Closed)?
    }

    pub fn status(&self) -> watch::Receiver<PipelineStatus> {
        self.status.clone()
    }

    /// Latest published status
    pub fn current(&self) -> PipelineStatus {
        self.status.borrow().clone()
    }

    /// Overlay layered over the live video
    pub fn surface(&self) -> SharedSurface {
        self.surface.clone()
    }

    pub fn health(&self) -> Arc<PipelineHealth> {
        self.health.clone()
    }
}

async fn next_chunk(chunks: &mut Option<mpsc::Receiver<Bytes>>) -> Option<Bytes> {
    match chunks {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_ready(stream: &mut Option<LiveStream>) -> bool {
    match stream {
        Some(stream) => stream.ready().await,
        None => std::future::pending().await,
    }
}

/// Coordinates camera, pose sampling and recording
///
/// Runs as a single task; every event is applied to completion before the
/// next one is looked at.
pub struct PipelineController {
    config: ControllerConfig,
    state: PipelineState,
    last_error: Option<PipelineError>,

    // Camera
    source: CameraSource,
    stream_tx: watch::Sender<Option<LiveStream>>,
    pending_ready: Option<LiveStream>,
    ready: bool,

    // Pose
    sampler: PoseSamplingLoop,
    sampling_events: mpsc::UnboundedReceiver<SamplingEvent>,
    pose: PoseCondition,
    surface: SharedSurface,

    // Recording
    encoder: Arc<dyn RecordingEncoder>,
    recording: RecordingSession,
    chunks: Option<mpsc::Receiver<Bytes>>,
    upload: Arc<dyn UploadSink>,

    health: Arc<PipelineHealth>,
    status_tx: watch::Sender<PipelineStatus>,
}

impl PipelineController {
    fn new(config: ControllerConfig, collaborators: Collaborators) -> Self {
        let surface = OverlaySurface::shared();
        let health = Arc::new(PipelineHealth::new());
        let (events_tx, sampling_events) = mpsc::unbounded_channel();
        let sampler = PoseSamplingLoop::new(
            collaborators.estimator,
            config.model.clone(),
            Arc::new(AnnotationRenderer::new(config.render.clone())),
            surface.clone(),
            health.clone(),
            config.sampling.clone(),
            events_tx,
        );
        let recording = RecordingSession::new(
            collaborators.encoder.format(),
            config.recording.settle_limit,
        );
        let source = CameraSource::new(collaborators.camera, config.capture.clone());
        let (stream_tx, _) = watch::channel(None);
        let (status_tx, _) = watch::channel(PipelineStatus {
            state: PipelineState::Idle,
            ready: false,
            sampling: SamplingState::Stopped,
            pose: PoseCondition::Off,
            finalizing: false,
            capture: config.capture.clone(),
            artifact: None,
            last_error: None,
        });

        Self {
            config,
            state: PipelineState::Idle,
            last_error: None,
            source,
            stream_tx,
            pending_ready: None,
            ready: false,
            sampler,
            sampling_events,
            pose: PoseCondition::Off,
            surface,
            encoder: collaborators.encoder,
            recording,
            chunks: None,
            upload: collaborators.upload,
            health,
            status_tx,
        }
    }

    /// Start the controller task. It runs until `shutdown` is cancelled, a
    /// `Shutdown` event arrives or every handle is dropped; the camera is
    /// released on the way out.
    pub fn spawn(
        config: ControllerConfig,
        collaborators: Collaborators,
        shutdown: CancellationToken,
    ) -> (ControllerHandle, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let controller = Self::new(config, collaborators);
        let handle = ControllerHandle {
            commands: commands_tx,
            status: controller.status_tx.subscribe(),
            surface: controller.surface.clone(),
            health: controller.health.clone(),
        };
        let task = tokio::spawn(controller.run(commands_rx, shutdown));
        (handle, task)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>, shutdown: CancellationToken) {
        info!("PipelineController: started");

        let period = self.config.health_log_interval.max(Duration::from_secs(1));
        let mut health_tick = interval_at(tokio::time::Instant::now() + period, period);
        health_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut settle_tick = interval(self.config.recording.settle_interval());
        settle_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("PipelineController: shutdown requested");
                    break;
                }
                command = commands.recv() => {
                    let Some(Command { event, reply }) = command else {
                        debug!("PipelineController: all handles dropped");
                        break;
                    };
                    let stop = event == PipelineEvent::Shutdown;
                    let was_finalizing = self.recording.is_finalizing();

                    let result = self.handle_event(event).await;
                    match &result {
                        Ok(_) => self.last_error = None,
                        Err(err) => self.last_error = Some(err.clone()),
                    }
                    if self.recording.is_finalizing() && !was_finalizing {
                        settle_tick.reset();
                    }
                    self.publish();
                    let _ = reply.send(result);

                    if stop {
                        break;
                    }
                }
                Some(event) = self.sampling_events.recv() => {
                    self.on_sampling_event(event).await;
                }
                chunk = next_chunk(&mut self.chunks), if self.chunks.is_some() => {
                    self.on_chunk(chunk).await;
                }
                ready = wait_ready(&mut self.pending_ready), if self.pending_ready.is_some() => {
                    self.on_ready(ready);
                }
                _ = settle_tick.tick(), if self.recording.is_finalizing() => {
                    if let Some(result) = self.recording.settle_tick() {
                        warn!("PipelineController: encoder never closed its stream, finalizing");
                        self.chunks = None;
                        self.on_finalized(result).await;
                    }
                }
                _ = health_tick.tick() => {
                    info!("PipelineController: {}", self.health.summary());
                }
            }
        }

        self.release_camera().await;
        self.publish();
        info!("PipelineController: stopped. {}", self.health.summary());
    }

    async fn handle_event(&mut self, event: PipelineEvent) -> Result<Ack, PipelineError> {
        debug!("PipelineController: {:?} in {}", event, self.state);

        let result = match event {
            PipelineEvent::Configure(config) => self.configure(config).await,
            PipelineEvent::ChangeResolution(resolution) => {
                let config = self.source.config().with_resolution(resolution);
                self.reconfigure(config, "change resolution").await
            }
            PipelineEvent::ChangeFrameRate(frame_rate) => {
                let config = self.source.config().with_frame_rate(frame_rate);
                self.reconfigure(config, "change frame rate").await
            }
            PipelineEvent::SwitchCamera => self.switch_camera().await,
            PipelineEvent::TogglePose => self.toggle_pose().await,
            PipelineEvent::StartRecording => self.start_recording().await,
            PipelineEvent::StopRecording => self.stop_recording(),
            PipelineEvent::Retake => self.retake(),
            PipelineEvent::Export(path) => self.export(path).await,
            PipelineEvent::Upload => self.upload().await,
            PipelineEvent::Shutdown => Ok(Ack::Done),
        };

        if let Err(err) = &result {
            warn!("PipelineController: request rejected in {}: {}", self.state, err);
        }
        result
    }

    fn set_state(&mut self, next: PipelineState) {
        if next == self.state {
            return;
        }
        if !self.state.can_transition_to(&next) {
            error!("PipelineController: unexpected transition {} -> {}", self.state, next);
        }
        info!("PipelineController: {} -> {}", self.state, next);
        self.state = next;
    }

    fn publish(&self) {
        self.status_tx.send_replace(PipelineStatus {
            state: self.state,
            ready: self.ready,
            sampling: self.sampler.state(),
            pose: self.pose,
            finalizing: self.recording.is_finalizing(),
            capture: self.source.config().clone(),
            artifact: self.recording.artifact(),
            last_error: self.last_error.clone(),
        });
    }

    // ── Camera ──────────────────────────────────────────────

    fn check_camera_change(&self, operation: &'static str) -> Result<(), StateError> {
        match self.state {
            PipelineState::Recording { .. } => Err(StateError::OperationNotAllowedWhileRecording),
            PipelineState::Reviewing => Err(StateError::InvalidTransition {
                from: self.state,
                operation,
            }),
            _ => Ok(()),
        }
    }

    async fn configure(&mut self, config: CaptureConfig) -> Result<Ack, PipelineError> {
        self.check_camera_change("configure the camera")?;
        config.validate()?;
        self.open_camera(config).await
    }

    /// Apply a derived configuration. Before the camera is live the new
    /// values are only stored for the next open.
    async fn reconfigure(
        &mut self,
        config: CaptureConfig,
        operation: &'static str,
    ) -> Result<Ack, PipelineError> {
        self.check_camera_change(operation)?;
        config.validate()?;

        if self.state == PipelineState::Idle {
            info!("PipelineController: stored {:?} for the next open", config);
            self.source.set_config(config);
            return Ok(Ack::Done);
        }
        self.open_camera(config).await
    }

    async fn switch_camera(&mut self) -> Result<Ack, PipelineError> {
        self.check_camera_change("switch camera")?;
        if self.state == PipelineState::Idle {
            return Err(StateError::NotLive.into());
        }

        let device_id = match self.source.next_device().await {
            Ok(id) => id,
            Err(DeviceError::NoAlternativeDevice) => {
                info!("PipelineController: only one camera present, switch ignored");
                return Ok(Ack::DeviceUnchanged);
            }
            Err(err) => return Err(err.into()),
        };

        let result = self.source.switch_device(&device_id).await;
        self.camera_changed(result).await
    }

    async fn open_camera(&mut self, config: CaptureConfig) -> Result<Ack, PipelineError> {
        let result = self.source.configure(config).await;
        self.camera_changed(result).await
    }

    /// Publish the outcome of a camera change. Pose detection keeps running
    /// across it: the sampling loop follows the stream published here.
    async fn camera_changed(
        &mut self,
        result: Result<LiveStream, DeviceError>,
    ) -> Result<Ack, PipelineError> {
        self.publish_stream();

        match result {
            Ok(_) => {
                if self.state == PipelineState::Idle {
                    self.set_state(PipelineState::PREVIEWING);
                }
                Ok(Ack::Done)
            }
            Err(err) => {
                if !self.source.is_open() {
                    self.camera_lost().await;
                }
                Err(err.into())
            }
        }
    }

    /// The camera could be neither changed nor restored. A stopped recording
    /// still waiting for its encoder is finalized from what was buffered.
    async fn camera_lost(&mut self) {
        if let Some(result) = self.recording.finish_now() {
            warn!(
                "PipelineController: camera lost while finalizing, keeping {} buffered chunk(s)",
                self.recording.buffer().chunk_count()
            );
            self.chunks = None;
            self.on_finalized(result).await;
        }

        if self.state.is_reviewing() {
            self.source.close();
            self.publish_stream();
        } else {
            self.release_camera().await;
        }
    }

    fn publish_stream(&mut self) {
        let stream = self.source.stream();
        self.ready = stream.as_ref().is_some_and(LiveStream::is_ready);
        self.pending_ready = stream.clone().filter(|s| !s.is_ready());
        self.stream_tx.send_replace(stream);
    }

    fn on_ready(&mut self, ready: bool) {
        self.pending_ready = None;
        self.ready = ready;
        if ready {
            info!("PipelineController: live video ready");
        } else {
            warn!("PipelineController: camera closed before the first frame");
        }
        self.publish();
    }

    /// Drop everything that depends on the camera and return to Idle
    async fn release_camera(&mut self) {
        self.sampler.deactivate().await;
        self.pose = PoseCondition::Off;
        self.recording.reset();
        self.chunks = None;
        self.source.close();
        self.publish_stream();
        self.set_state(PipelineState::Idle);
    }

    // ── Pose ────────────────────────────────────────────────

    async fn toggle_pose(&mut self) -> Result<Ack, PipelineError> {
        match self.state {
            PipelineState::Idle => return Err(StateError::NotLive.into()),
            PipelineState::Reviewing => {
                return Err(StateError::InvalidTransition {
                    from: self.state,
                    operation: "toggle pose detection",
                }
                .into());
            }
            _ => {}
        }

        if self.state.pose_active() {
            self.sampler.deactivate().await;
            self.pose = PoseCondition::Off;
            self.set_state(self.state.with_pose(false));
        } else {
            self.surface.lock().await.clear();
            if !self.sampler.activate(self.stream_tx.subscribe()) {
                warn!("PipelineController: pose sampling already active");
            }
            self.pose = PoseCondition::Loading;
            self.set_state(self.state.with_pose(true));
        }
        Ok(Ack::Done)
    }

    async fn on_sampling_event(&mut self, event: SamplingEvent) {
        let Some(event) = self.sampler.handle_event(event) else {
            return;
        };

        match event {
            SamplingEvent::Running { .. } => {
                self.pose = PoseCondition::Running;
            }
            SamplingEvent::LoadFailed { error, .. }
            | SamplingEvent::PoseUnavailable { error, .. } => {
                warn!("PipelineController: pose detection disabled: {}", error);
                self.surface.lock().await.clear();
                self.pose = PoseCondition::Unavailable;
                self.set_state(self.state.with_pose(false));
                self.last_error = Some(error.into());
            }
            SamplingEvent::Stopped { generation } => {
                debug!("PipelineController: sampling generation {} stopped", generation);
            }
        }
        self.publish();
    }

    // ── Recording ───────────────────────────────────────────

    async fn start_recording(&mut self) -> Result<Ack, PipelineError> {
        match self.state {
            PipelineState::Idle => return Err(StateError::NotLive.into()),
            PipelineState::Reviewing => return Err(RecordingError::ReviewPending.into()),
            PipelineState::Recording { .. } => return Err(RecordingError::AlreadyRecording.into()),
            PipelineState::Live { .. } => {}
        }
        if self.recording.is_finalizing() {
            return Err(StateError::RecordingFinalizing.into());
        }

        let stream = self.source.stream().ok_or(StateError::NotLive)?;
        let session = self.encoder.open(stream).await?;
        if let Err(err) = self.recording.start(session.control.clone()) {
            session.control.stop();
            return Err(err.into());
        }
        self.chunks = Some(session.chunks);

        self.set_state(PipelineState::Recording {
            pose_active: self.state.pose_active(),
            started_at: Instant::now(),
        });
        Ok(Ack::Done)
    }

    fn stop_recording(&mut self) -> Result<Ack, PipelineError> {
        let PipelineState::Recording { pose_active, .. } = self.state else {
            return Err(RecordingError::NotRecording.into());
        };

        if let Some(duration) = self.state.recording_duration() {
            info!("PipelineController: recorded {:.1}s", duration.as_secs_f64());
        }
        self.recording.stop()?;
        self.set_state(PipelineState::Live { pose_active });
        Ok(Ack::Done)
    }

    async fn on_chunk(&mut self, chunk: Option<Bytes>) {
        match chunk {
            Some(chunk) => {
                let size = chunk.len();
                if self.recording.push_chunk(chunk) {
                    self.health.record_chunk(size);
                    debug!("PipelineController: buffered {} byte chunk", size);
                } else if size == 0 {
                    self.health.record_chunk(0);
                }
            }
            None => {
                self.chunks = None;
                if let Some(result) = self.recording.end_of_stream() {
                    self.on_finalized(result).await;
                }
            }
        }
    }

    async fn on_finalized(&mut self, result: Finalized) {
        // The encoder can end on its own while still recording
        if let PipelineState::Recording { pose_active, .. } = self.state {
            self.set_state(PipelineState::Live { pose_active });
        }

        match result {
            Ok(artifact) => {
                self.sampler.deactivate().await;
                self.pose = PoseCondition::Off;
                self.set_state(PipelineState::Reviewing);

                if self.config.recording.auto_export {
                    let path = export_path(&self.config.recording.export_dir, &artifact);
                    if let Err(err) = save_artifact(&artifact, &path).await {
                        error!("PipelineController: automatic export failed: {:#}", err);
                        self.last_error = Some(PipelineError::Export(format!("{:#}", err)));
                    }
                }
            }
            Err(err) => {
                warn!("PipelineController: recording discarded: {}", err);
                self.last_error = Some(err.into());
            }
        }
        self.publish();
    }

    fn retake(&mut self) -> Result<Ack, PipelineError> {
        if !self.state.is_reviewing() {
            return Err(RecordingError::NotReady.into());
        }
        self.recording.retake()?;

        let next = if self.source.is_open() {
            PipelineState::PREVIEWING
        } else {
            PipelineState::Idle
        };
        self.set_state(next);
        Ok(Ack::Done)
    }

    async fn export(&mut self, path: Option<PathBuf>) -> Result<Ack, PipelineError> {
        let artifact = self.recording.artifact().ok_or(StateError::NoArtifact)?;
        let path =
            path.unwrap_or_else(|| export_path(&self.config.recording.export_dir, &artifact));

        save_artifact(&artifact, &path)
            .await
            .map_err(|e| PipelineError::Export(format!("{:#}", e)))?;
        Ok(Ack::Exported(path))
    }

    async fn upload(&mut self) -> Result<Ack, PipelineError> {
        let artifact = self.recording.artifact().ok_or(StateError::NoArtifact)?;
        let size = artifact.len();

        self.upload
            .upload(artifact)
            .await
            .map_err(|e| PipelineError::Export(format!("upload failed: {:#}", e)))?;
        Ok(Ack::Uploaded(size))
    }
}
