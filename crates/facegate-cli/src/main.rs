mod config;
mod controls;
mod render;
mod session;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use controls::{AutoCapture, Controls, StdinControls};
use facegate_core::enroll::SAMPLES_PER_ENROLLMENT;
use facegate_core::{
    EnrollmentSession, EnrollmentStore, FaceDetector, ScrfdDetector, VerificationSession,
};
use facegate_hw::{Camera, FrameSource, ReplaySource};
use render::ConsoleRenderer;
use session::{EnrollOutcome, SessionIo};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "facegate", about = "Face enrollment and identity verification")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Read frames from a directory of images instead of the camera
    #[arg(long, global = true, value_name = "DIR")]
    replay: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture three photos of one person and register them
    Enroll {
        /// Identifier stored with the face (re-enrolling replaces it)
        #[arg(long)]
        id: String,
        /// Display name shown on a successful match
        #[arg(long)]
        name: String,
        /// Capture automatically instead of waiting for Enter
        #[arg(long)]
        auto: bool,
    },
    /// Continuously identify faces against everyone enrolled
    Verify,
    /// List enrolled identities
    List {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run camera and detector diagnostics
    Test,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    tracing::debug!(?config, "configuration loaded");

    match cli.command {
        Commands::Enroll { id, name, auto } => enroll(&config, cli.replay.as_deref(), id, name, auto),
        Commands::Verify => verify(&config, cli.replay.as_deref()),
        Commands::List { json } => list(&config, json),
        Commands::Test => diagnostics(&config, cli.replay.as_deref()),
    }
}

/// Run `f` against the replay directory if given, otherwise the live camera.
/// The second argument is the number of warmup frames to discard.
fn with_source<T>(
    config: &Config,
    replay: Option<&Path>,
    f: impl FnOnce(&mut dyn FrameSource, usize) -> Result<T>,
) -> Result<T> {
    match replay {
        Some(dir) => {
            let mut source = ReplaySource::open(dir, config.replay_frame_period())
                .context("failed to open replay directory")?;
            f(&mut source, 0)
        }
        None => {
            let camera = Camera::open(&config.camera_device)
                .with_context(|| format!("failed to open camera {}", config.camera_device))?;
            tracing::info!(
                device = %camera.device_path,
                width = camera.width,
                height = camera.height,
                "camera opened"
            );
            let mut stream = camera.stream()?;
            f(&mut stream, config.warmup_frames)
        }
    }
}

fn load_detector(config: &Config) -> Result<ScrfdDetector> {
    let path = config.scrfd_model_path();
    ScrfdDetector::load(&path, config.detector_confidence)
        .with_context(|| format!("failed to load face detector from {}", path.display()))
}

fn open_store(config: &Config) -> Result<EnrollmentStore> {
    let store = EnrollmentStore::open(&config.db_path).context("enrollment store unavailable")?;
    tracing::info!(path = %store.path().display(), "using enrollment store");
    Ok(store)
}

fn enroll(config: &Config, replay: Option<&Path>, id: String, name: String, auto: bool) -> Result<()> {
    let store = open_store(config)?;
    let mut detector = load_detector(config)?;
    let mut controls: Box<dyn Controls> = if auto {
        Box::new(AutoCapture::new(StdinControls::spawn()))
    } else {
        Box::new(StdinControls::spawn())
    };
    let mut renderer = ConsoleRenderer::default();
    let mut enrollment = EnrollmentSession::new(id, name, config.enroll_config());

    println!("Enrolling {} (ID: {})", enrollment.name(), enrollment.id());
    if !auto {
        println!("Press Enter to take a photo, or type q to cancel.");
    }

    let outcome = with_source(config, replay, |source, warmup| {
        let mut io = SessionIo {
            source,
            detector: &mut detector,
            controls: controls.as_mut(),
            renderer: &mut renderer,
        };
        io.discard_warmup(warmup);
        session::run_enrollment(&mut io, &store, &mut enrollment)
    })?;

    match outcome {
        EnrollOutcome::Registered(identity) => {
            println!(
                "Registered {} with {} photos",
                identity.name(),
                identity.face_images().len()
            );
            Ok(())
        }
        EnrollOutcome::Cancelled => {
            println!("Enrollment cancelled; nothing was saved");
            Ok(())
        }
        EnrollOutcome::SourceExhausted { captured } => {
            bail!("frame source ended after {captured} of {SAMPLES_PER_ENROLLMENT} photos")
        }
    }
}

fn verify(config: &Config, replay: Option<&Path>) -> Result<()> {
    let store = open_store(config)?;
    let mut verification = VerificationSession::open(&store, config.verify_config())?;
    let mut detector = load_detector(config)?;
    let mut controls = StdinControls::spawn();
    let mut renderer = ConsoleRenderer::default();

    println!(
        "Verifying against {} enrolled identities. Type q to stop.",
        verification.gallery().len()
    );

    let summary = with_source(config, replay, |source, warmup| {
        let mut io = SessionIo {
            source,
            detector: &mut detector,
            controls: &mut controls,
            renderer: &mut renderer,
        };
        io.discard_warmup(warmup);
        session::run_verification(&mut io, &mut verification)
    })?;

    tracing::info!(
        frames = summary.frames,
        scores = summary.scores,
        matched = summary.last_verdict.as_ref().is_some_and(|v| v.matched),
        "verification finished"
    );
    println!(
        "Processed {} frames, {} scoring passes",
        summary.frames, summary.scores
    );
    Ok(())
}

fn list(config: &Config, json: bool) -> Result<()> {
    let store = open_store(config)?;
    let identities = store.list()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&identities)?);
        return Ok(());
    }
    if identities.is_empty() {
        println!("No identities enrolled");
        return Ok(());
    }

    println!("{:<16} {:<24} {:>7}  ENROLLED", "ID", "NAME", "PHOTOS");
    for identity in &identities {
        println!(
            "{:<16} {:<24} {:>7}  {}",
            identity.id, identity.name, identity.samples, identity.created_at
        );
    }
    Ok(())
}

fn diagnostics(config: &Config, replay: Option<&Path>) -> Result<()> {
    println!("Running camera diagnostics...");

    if replay.is_none() {
        let devices = Camera::list_devices();
        if devices.is_empty() {
            println!("No V4L2 capture devices found");
        }
        for device in &devices {
            println!("  {}  {} ({}, {})", device.path, device.name, device.driver, device.bus);
        }
    }

    let mut detector = match load_detector(config) {
        Ok(detector) => Some(detector),
        Err(e) => {
            println!("Detector: unavailable ({e:#})");
            None
        }
    };

    with_source(config, replay, |source, warmup| {
        for _ in 0..warmup {
            source.next_frame()?;
        }
        let Some(frame) = source.next_frame()? else {
            println!("No frames available");
            return Ok(());
        };
        println!(
            "Frame: {}x{}, brightness {:.1}",
            frame.width(),
            frame.height(),
            frame.avg_brightness()
        );
        if let Some(detector) = detector.as_mut() {
            let faces = detector.detect(&frame.image)?;
            println!("Faces detected: {}", faces.len());
            for face in &faces {
                println!("  {}x{} at ({}, {})", face.width, face.height, face.x, face.y);
            }
        }
        Ok(())
    })
}
