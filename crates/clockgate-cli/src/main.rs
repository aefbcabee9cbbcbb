use anyhow::{bail, Context, Result};
use clap::builder::BoolishValueParser;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::str::FromStr;

use clockgate_core::{transition, ActivityType, AttendanceState, Thresholds};
use clockgate_device::DeviceProfile;

const BUS_NAME: &str = "io.clockgate.Kiosk1";
const OBJECT_PATH: &str = "/io/clockgate/Kiosk1";
const INTERFACE: &str = "io.clockgate.Kiosk1";

#[derive(Parser)]
#[command(name = "clockgate", version, about = "Clockgate kiosk control and diagnostics")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus.
    #[arg(
        long,
        global = true,
        env = "CLOCKGATE_SESSION_BUS",
        value_parser = BoolishValueParser::new()
    )]
    session: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check an attendance transition offline.
    Transition { state: String, activity: String },
    /// List the activities allowed from a state.
    Allowed { state: String },
    /// Print the device fingerprint headers sent with every request.
    Fingerprint,
    /// Validate a thresholds file and print the effective values.
    Thresholds {
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Open a capture session for an activity.
    Start { activity: String },
    /// End the current session.
    Stop,
    /// Pause sampling.
    Suspend,
    /// Resume sampling after a suspend.
    Resume,
    /// Capture now instead of waiting for auto-capture.
    Capture,
    /// Dismiss the result screen and start sampling again.
    Dismiss,
    /// Set the kiosk location.
    Location {
        #[arg(allow_hyphen_values = true)]
        latitude: f64,
        #[arg(allow_hyphen_values = true)]
        longitude: f64,
    },
    /// Show daemon status.
    Status,
    /// Show recently cached clock results.
    Recent {
        #[arg(long, default_value_t = 10)]
        limit: u32,
    },
    /// Show the locally mirrored state of a staff member.
    State { staff: String },
}

fn check_transition(state: &str, activity: &str) -> Result<AttendanceState> {
    let state = AttendanceState::from_str(state)?;
    let activity = ActivityType::from_str(activity)?;
    Ok(transition(state, activity)?)
}

fn load_thresholds(file: Option<&PathBuf>) -> Result<Thresholds> {
    match file {
        Some(path) => {
            let source = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
            Thresholds::from_toml_str(&source).with_context(|| format!("invalid thresholds in {}", path.display()))
        }
        None => Ok(Thresholds::default()),
    }
}

async fn proxy(session: bool) -> Result<zbus::Proxy<'static>> {
    let conn = if session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to D-Bus")?;
    let proxy = zbus::Proxy::new(&conn, BUS_NAME, OBJECT_PATH, INTERFACE)
        .await
        .context("clockgated is not reachable")?;
    Ok(proxy)
}

fn print_json(json: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(json)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.cmd {
        Commands::Transition { state, activity } => {
            let next = check_transition(&state, &activity)?;
            println!("{next}");
        }
        Commands::Allowed { state } => {
            let state = AttendanceState::from_str(&state)?;
            for activity in state.allowed_activities() {
                println!("{activity} -> {}", activity.resulting_state());
            }
        }
        Commands::Fingerprint => {
            let profile = DeviceProfile::probe()?;
            let headers = profile.headers()?;
            for (name, value) in headers.pairs() {
                println!("{name}: {value}");
            }
        }
        Commands::Thresholds { file } => {
            let thresholds = load_thresholds(file.as_ref())?;
            print!("{}", toml::to_string_pretty(&thresholds)?);
        }
        cmd => {
            let proxy = proxy(cli.session).await?;
            match cmd {
                Commands::Start { activity } => {
                    let activity = ActivityType::from_str(&activity)?;
                    let id: String = proxy.call("StartSession", &(activity.as_str(),)).await?;
                    println!("session {id} started for {activity}");
                }
                Commands::Stop => proxy.call::<_, _, ()>("StopSession", &()).await?,
                Commands::Suspend => proxy.call::<_, _, ()>("Suspend", &()).await?,
                Commands::Resume => proxy.call::<_, _, ()>("Resume", &()).await?,
                Commands::Capture => {
                    let started: bool = proxy.call("ManualCapture", &()).await?;
                    if !started {
                        bail!("this session has already captured");
                    }
                    println!("capture started");
                }
                Commands::Dismiss => proxy.call::<_, _, ()>("DismissResult", &()).await?,
                Commands::Location { latitude, longitude } => {
                    proxy
                        .call::<_, _, ()>("SetLocation", &(latitude, longitude))
                        .await?
                }
                Commands::Status => {
                    let json: String = proxy.call("Status", &()).await?;
                    print_json(&json)?;
                }
                Commands::Recent { limit } => {
                    let json: String = proxy.call("RecentClocks", &(limit,)).await?;
                    print_json(&json)?;
                }
                Commands::State { staff } => {
                    let state: String = proxy.call("CurrentState", &(staff.as_str(),)).await?;
                    println!("{state}");
                }
                Commands::Transition { .. }
                | Commands::Allowed { .. }
                | Commands::Fingerprint
                | Commands::Thresholds { .. } => unreachable!("handled offline"),
            }
        }
    }
    Ok(())
}
