//! Telecare Call - clinician/patient video consultation
//!
//! Runs consultations over an in-process signaling fabric so the call
//! lifecycle can be exercised from a terminal.

mod calling;
mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use calling::devices::PlatformMediaError;
use calling::loopback::{LoopbackDevices, LoopbackFabric};
use calling::rendezvous::{LocationRendezvous, RendezvousChannel, SharedLocation};
use calling::view::ConsoleView;
use calling::{CallController, CallControls, CallOptions, Role, SessionSummary};
use config::Config;

#[derive(Parser)]
#[command(name = "telecare-call")]
#[command(about = "Two-party video consultation runner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a consultation over the in-process fabric
    Consult {
        /// Appointment the call belongs to
        #[arg(short, long)]
        appointment: String,

        /// Run only one party (both run when omitted)
        #[arg(short, long, value_enum)]
        role: Option<RoleArg>,

        /// Seconds to stay in the call before hanging up
        #[arg(short, long, default_value = "10")]
        duration: u64,

        /// Simulate the user denying camera/microphone access
        #[arg(long)]
        deny_camera: bool,

        /// Simulate a camera held by another application
        #[arg(long)]
        busy_camera: bool,

        /// Simulate a machine with no camera or microphone
        #[arg(long)]
        no_camera: bool,

        /// Simulate a page served over plain HTTP
        #[arg(long)]
        insecure: bool,

        /// Join without a camera
        #[arg(long)]
        audio_only: bool,

        /// Mute the microphone this many seconds into the call
        #[arg(long, value_name = "SECS")]
        mute_after: Option<u64>,

        /// Turn the camera off this many seconds into the call
        #[arg(long, value_name = "SECS")]
        video_off_after: Option<u64>,

        /// Print session summaries as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show or initialize the configuration file
    Config {
        /// Write the default configuration
        #[arg(long)]
        init: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RoleArg {
    #[value(alias = "doctor", alias = "clinician")]
    Initiator,
    #[value(alias = "patient")]
    Responder,
}

impl From<RoleArg> for Role {
    fn from(arg: RoleArg) -> Self {
        match arg {
            RoleArg::Initiator => Role::Initiator,
            RoleArg::Responder => Role::Responder,
        }
    }
}

/// Simulated device conditions, shared by every party of a run.
struct DeviceFlags {
    deny_camera: bool,
    busy_camera: bool,
    no_camera: bool,
    insecure: bool,
}

impl DeviceFlags {
    fn devices(&self) -> LoopbackDevices {
        let mut devices = LoopbackDevices::new();
        if self.insecure {
            devices = devices.insecure();
        }
        if self.deny_camera {
            devices = devices.fail_next(PlatformMediaError::new(
                "NotAllowedError",
                "Permission denied",
            ));
        }
        if self.busy_camera {
            devices = devices.fail_next(PlatformMediaError::new(
                "NotReadableError",
                "Could not start video source",
            ));
        }
        if self.no_camera {
            devices = devices.fail_next(PlatformMediaError::new(
                "NotFoundError",
                "Requested device not found",
            ));
        }
        devices
    }
}

/// Scripted button presses, applied to every party of a run.
struct ControlScript {
    mute_after: Option<Duration>,
    video_off_after: Option<Duration>,
}

impl ControlScript {
    fn schedule(&self, controls: &CallControls) {
        if let Some(delay) = self.mute_after {
            let controls = controls.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                controls.toggle_mute();
            });
        }
        if let Some(delay) = self.video_off_after {
            let controls = controls.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                controls.toggle_video();
            });
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Consult {
            appointment,
            role,
            duration,
            deny_camera,
            busy_camera,
            no_camera,
            insecure,
            audio_only,
            mute_after,
            video_off_after,
            json,
        } => {
            let flags = DeviceFlags {
                deny_camera,
                busy_camera,
                no_camera,
                insecure,
            };
            let mut config = Config::load()?;
            if audio_only {
                config.media.video = false;
            }
            let script = ControlScript {
                mute_after: mute_after.map(Duration::from_secs),
                video_off_after: video_off_after.map(Duration::from_secs),
            };
            let roles = match role {
                Some(role) => vec![Role::from(role)],
                None => vec![Role::Responder, Role::Initiator],
            };
            let summaries = consult(
                config,
                &appointment,
                &roles,
                &flags,
                &script,
                Duration::from_secs(duration),
            )
            .await?;
            print_summaries(&summaries, json)?;
        }
        Commands::Config { init } => {
            let config = if init {
                let config = Config::default();
                let path = config.save()?;
                println!("Wrote default configuration to {}", path.display());
                config
            } else {
                println!("Configuration file: {}", Config::config_path()?.display());
                Config::load()?
            };
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

/// Run the given parties against one loopback fabric and one shared location.
async fn consult(
    config: Config,
    appointment: &str,
    roles: &[Role],
    flags: &DeviceFlags,
    script: &ControlScript,
    duration: Duration,
) -> Result<Vec<SessionSummary>> {
    let fabric = LoopbackFabric::new();

    let location = SharedLocation::parse("https://clinic.local/video-call")
        .context("Invalid call location")?;
    location.replace_query_param("appointmentId", appointment);
    let rendezvous: Arc<dyn RendezvousChannel> = Arc::new(LocationRendezvous::new(
        location.clone(),
        config.rendezvous.query_param.clone(),
    ));

    tracing::info!("Starting consultation for appointment {}", appointment);

    let mut controls: Vec<CallControls> = Vec::new();
    let mut tasks = Vec::new();
    for &role in roles {
        let (controller, handle) = CallController::new(
            config.clone(),
            CallOptions {
                appointment_id: appointment.to_string(),
                role,
            },
            Arc::new(fabric.clone()),
            Arc::new(flags.devices()),
            Arc::clone(&rendezvous),
            Box::new(ConsoleView::stdout(role.label())),
            move || tracing::info!("{} left the call", role.label()),
        );
        script.schedule(&handle);
        controls.push(handle);
        tasks.push(tokio::spawn(controller.run()));
    }

    tokio::select! {
        _ = tokio::time::sleep(duration) => {
            tracing::info!("Consultation time is up");
        }
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            tracing::info!("Interrupted");
        }
    }

    for handle in &controls {
        handle.end_call();
    }

    let mut summaries = Vec::with_capacity(tasks.len());
    for task in tasks {
        summaries.push(task.await.context("Call task panicked")?);
    }
    tracing::info!("Final location: {}", location.href());
    Ok(summaries)
}

fn print_summaries(summaries: &[SessionSummary], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summaries)?);
        return Ok(());
    }

    for summary in summaries {
        let connected = summary
            .connected_secs
            .map(|secs| format!("{}s connected", secs))
            .unwrap_or_else(|| "never connected".to_string());
        println!(
            "{:<8} {:<14} {} ({})",
            summary.role.label(),
            summary.final_state.to_string(),
            summary.session_id,
            connected
        );
    }
    Ok(())
}
