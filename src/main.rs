use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use log::{info, warn};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use posecam::capture::{CameraBackend, Resolution, SyntheticCamera};
use posecam::config::{AppConfig, app_name, version};
use posecam::encoder::{ContainerFormat, MjpegEncoder, RecordingEncoder};
use posecam::pipeline::{
    Ack, Collaborators, ControllerHandle, PipelineController, PipelineEvent, PipelineState,
    PoseCondition,
};
use posecam::pose::PoseEstimator;
use posecam::workers::LogUploadSink;

fn cli() -> Command {
    Command::new(app_name())
        .version(version())
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file.")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("resolution")
                .short('r')
                .long("resolution")
                .value_name("WxH")
                .help("Capture resolution (640x480 or 1280x720).")
                .value_parser(value_parser!(Resolution)),
        )
        .arg(
            Arg::new("fps")
                .long("fps")
                .value_name("N")
                .help("Capture frame rate.")
                .value_parser(value_parser!(u32)),
        )
        .arg(
            Arg::new("device")
                .short('d')
                .long("device")
                .value_name("ID")
                .help("Camera device id."),
        )
        .arg(
            Arg::new("synthetic")
                .long("synthetic")
                .help("Use the synthetic test-pattern camera.")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("list-devices")
                .long("list-devices")
                .help("Print the available cameras and exit.")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("pose")
                .short('p')
                .long("pose")
                .help("Turn pose detection on once the video is live.")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("model")
                .short('m')
                .long("model")
                .value_name("FILE")
                .help("Pose model file.")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("record")
                .long("record")
                .value_name("SECONDS")
                .help("Record for the given number of seconds.")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("duration")
                .long("duration")
                .value_name("SECONDS")
                .help("Preview duration when not recording.")
                .value_parser(value_parser!(u64))
                .default_value("5"),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("FILE")
                .help("Where to save the recording.")
                .value_parser(value_parser!(PathBuf)),
        )
}

fn load_config(matches: &ArgMatches) -> Result<AppConfig> {
    let mut config = match matches.get_one::<PathBuf>("config") {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };

    if let Some(resolution) = matches.get_one::<Resolution>("resolution") {
        config.capture = config.capture.with_resolution(*resolution);
    }
    if let Some(fps) = matches.get_one::<u32>("fps") {
        config.capture = config.capture.with_frame_rate(*fps);
    }
    if let Some(device) = matches.get_one::<String>("device") {
        config.capture = config.capture.with_device(device.as_str());
    }
    if let Some(model) = matches.get_one::<PathBuf>("model") {
        config.model.path = Some(model.clone());
    }
    if matches.contains_id("output") {
        config.recording.auto_export = false;
    }

    config.capture.validate()?;
    Ok(config)
}

fn camera_backend(synthetic: bool) -> Arc<dyn CameraBackend> {
    if synthetic {
        return Arc::new(SyntheticCamera::new());
    }

    #[cfg(feature = "webcam")]
    {
        Arc::new(posecam::capture::WebcamBackend::default())
    }
    #[cfg(not(feature = "webcam"))]
    {
        info!("Built without webcam support, using the synthetic camera");
        Arc::new(SyntheticCamera::new())
    }
}

fn pose_estimator() -> Arc<dyn PoseEstimator> {
    #[cfg(feature = "onnx")]
    {
        Arc::new(posecam::pose::MoveNetEstimator)
    }
    #[cfg(not(feature = "onnx"))]
    {
        Arc::new(posecam::pose::DisabledEstimator)
    }
}

fn recording_encoder(config: &AppConfig) -> Arc<dyn RecordingEncoder> {
    let format = config.recording.format;
    let encoder = config.recording.encoder.clone();

    match format {
        ContainerFormat::Mjpeg => Arc::new(MjpegEncoder::new(encoder)),
        #[cfg(feature = "ffmpeg")]
        _ => Arc::new(posecam::encoder::FfmpegEncoder::new(format, encoder)),
        #[cfg(not(feature = "ffmpeg"))]
        _ => {
            warn!("{} recording needs the ffmpeg feature, recording MJPEG instead", format);
            Arc::new(MjpegEncoder::new(encoder))
        }
    }
}

/// Sleep unless shut down first. Returns false on shutdown.
async fn wait(duration: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

async fn session(
    handle: &ControllerHandle,
    matches: &ArgMatches,
    capture: posecam::capture::CaptureConfig,
    shutdown: &CancellationToken,
) -> Result<()> {
    handle.send(PipelineEvent::Configure(capture)).await?;

    let mut status = handle.status();
    tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        ready = status.wait_for(|s| s.ready) => { ready.context("controller stopped")?; }
    }
    info!("Live video ready");

    if matches.get_flag("pose") {
        handle.send(PipelineEvent::TogglePose).await?;
    }

    let Some(seconds) = matches.get_one::<u64>("record").copied() else {
        let seconds = matches.get_one::<u64>("duration").copied().unwrap_or(5);
        wait(Duration::from_secs(seconds), shutdown).await;
        if handle.current().pose == PoseCondition::Unavailable {
            warn!("Pose detection was unavailable during the preview");
        }
        return Ok(());
    };

    handle.send(PipelineEvent::StartRecording).await?;
    wait(Duration::from_secs(seconds), shutdown).await;
    handle.send(PipelineEvent::StopRecording).await?;

    let finished = status
        .wait_for(|s| !s.finalizing)
        .await
        .context("controller stopped")?
        .clone();
    if finished.state != PipelineState::Reviewing {
        match finished.last_error {
            Some(err) => bail!("recording failed: {}", err),
            None => bail!("recording failed"),
        }
    }

    if let Some(path) = matches.get_one::<PathBuf>("output") {
        if let Ack::Exported(path) = handle.send(PipelineEvent::Export(Some(path.clone()))).await? {
            info!("Recording saved to {}", path.display());
        }
    }
    handle.send(PipelineEvent::Upload).await?;
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let matches = cli().get_matches();
    let config = load_config(&matches)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building runtime")?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    // gracefully close the session when receiving SIGINT, SIGTERM, or SIGHUP
    ctrlc::set_handler(move || signal.cancel()).context("setting Ctrl-C handler")?;

    let result: Result<()> = runtime.block_on(async move {
        let camera = camera_backend(matches.get_flag("synthetic"));

        if matches.get_flag("list-devices") {
            for device in camera.list_devices().await? {
                println!("{}\t{}", device.id, device.label);
            }
            return Ok(());
        }

        let collaborators = Collaborators {
            camera,
            estimator: pose_estimator(),
            encoder: recording_encoder(&config),
            upload: Arc::new(LogUploadSink),
        };
        // Ctrl-C ends the session; the controller is shut down after it so a
        // running recording still gets finalized.
        let (handle, task) =
            PipelineController::spawn(config.controller(), collaborators, CancellationToken::new());

        let result = session(&handle, &matches, config.capture.clone(), &shutdown).await;

        let _ = handle.send(PipelineEvent::Shutdown).await;
        task.await.context("controller task failed")?;
        info!("{}", handle.health().summary());
        result
    });
    result
}
