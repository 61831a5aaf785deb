use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.freedesktop.Headcount1",
    default_service = "org.freedesktop.Headcount1",
    default_path = "/org/freedesktop/Headcount1"
)]
trait Headcount {
    async fn process_detections(&self, detections: &str) -> zbus::Result<String>;
    async fn reload_gallery(&self) -> zbus::Result<u64>;
    async fn reload_config(&self) -> zbus::Result<String>;
    async fn set_config(&self, match_threshold: f64, dedup_interval_secs: f64) -> zbus::Result<String>;
    async fn enroll(&self, name: &str, profile: &str, samples: &str) -> zbus::Result<i64>;
    async fn set_identity_active(&self, id: i64, active: bool) -> zbus::Result<bool>;
    async fn list_unknown_tracks(&self) -> zbus::Result<String>;
    async fn bump_unknown_track(&self, id: i64) -> zbus::Result<bool>;
    async fn resolve_unknown_track(&self, id: i64) -> zbus::Result<bool>;
    async fn promote_unknown_track(&self, id: i64, name: &str, profile: &str) -> zbus::Result<i64>;
    async fn attendance_report(&self, from: &str, to: &str) -> zbus::Result<String>;
    async fn recent_attendance(&self, limit: u32) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "headcount", about = "Headcount attendance CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit one frame of landmark sets (JSON [[[x, y], ...], ...])
    Submit {
        /// JSON file, or "-" for stdin
        file: PathBuf,
    },
    /// Reload the identity gallery from the database
    Reload,
    /// Reload match threshold and dedup interval from the database
    ReloadConfig,
    /// Change match threshold and dedup interval, and apply them
    SetConfig {
        /// Similarity a face must exceed to match, in (0, 1]
        #[arg(short, long)]
        threshold: f64,
        /// Seconds before the same person is recorded again
        #[arg(short, long)]
        interval: f64,
    },
    /// Enroll a person from several landmark sets of the same face
    Enroll {
        /// Display name
        #[arg(short, long)]
        name: String,
        /// Profile as JSON, e.g. '{"age": 30, "phone": "555-0100"}'
        #[arg(short, long, default_value = "")]
        profile: String,
        /// JSON file with at least three landmark sets, or "-" for stdin
        samples: PathBuf,
    },
    /// Stop matching against an enrolled identity
    Deactivate {
        /// Identity ID
        id: i64,
    },
    /// Resume matching against an enrolled identity
    Activate {
        /// Identity ID
        id: i64,
    },
    /// List open unknown tracks
    Unknowns,
    /// Count another sighting of an unknown track
    Bump {
        /// Track ID
        id: i64,
    },
    /// Close an unknown track
    Resolve {
        /// Track ID
        id: i64,
    },
    /// Turn an unknown track into a known identity
    Promote {
        /// Track ID
        id: i64,
        /// Display name
        #[arg(short, long)]
        name: String,
        /// Profile as JSON
        #[arg(short, long, default_value = "")]
        profile: String,
    },
    /// Attendance between two dates (YYYY-MM-DD, inclusive) or RFC 3339 times
    Report {
        from: String,
        to: String,
    },
    /// Show the latest attendance records
    Recent {
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    tracing::debug!(system_bus = cli.system, "connecting to headcountd");

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("connecting to D-Bus")?;
    let proxy = HeadcountProxy::new(&conn)
        .await
        .context("headcountd is not reachable")?;

    match cli.command {
        Commands::Submit { file } => {
            let payload = read_payload(&file)?;
            print_json(&proxy.process_detections(&payload).await?)?;
        }
        Commands::Reload => {
            let generation = proxy.reload_gallery().await?;
            println!("gallery generation {generation}");
        }
        Commands::ReloadConfig => {
            print_json(&proxy.reload_config().await?)?;
        }
        Commands::SetConfig {
            threshold,
            interval,
        } => {
            print_json(&proxy.set_config(threshold, interval).await?)?;
        }
        Commands::Enroll {
            name,
            profile,
            samples,
        } => {
            let samples = read_payload(&samples)?;
            let id = proxy.enroll(&name, &profile, &samples).await?;
            println!("enrolled {name} as {id}");
        }
        Commands::Deactivate { id } => set_active(&proxy, id, false).await?,
        Commands::Activate { id } => set_active(&proxy, id, true).await?,
        Commands::Unknowns => {
            print_json(&proxy.list_unknown_tracks().await?)?;
        }
        Commands::Bump { id } => {
            if proxy.bump_unknown_track(id).await? {
                println!("track {id} bumped");
            } else {
                println!("no open track {id}");
            }
        }
        Commands::Resolve { id } => {
            if proxy.resolve_unknown_track(id).await? {
                println!("track {id} resolved");
            } else {
                println!("no open track {id}");
            }
        }
        Commands::Promote { id, name, profile } => {
            let identity = proxy.promote_unknown_track(id, &name, &profile).await?;
            if identity < 0 {
                println!("no open track {id}");
            } else {
                println!("track {id} is now {name} ({identity})");
            }
        }
        Commands::Report { from, to } => {
            print_json(&proxy.attendance_report(&from, &to).await?)?;
        }
        Commands::Recent { limit } => {
            print_json(&proxy.recent_attendance(limit).await?)?;
        }
        Commands::Status => {
            print_json(&proxy.status().await?)?;
        }
    }

    Ok(())
}

async fn set_active(proxy: &HeadcountProxy<'_>, id: i64, active: bool) -> Result<()> {
    if proxy.set_identity_active(id, active).await? {
        let state = if active { "active" } else { "inactive" };
        println!("identity {id} is now {state}");
    } else {
        println!("no identity {id}");
    }
    Ok(())
}

fn read_payload(path: &Path) -> Result<String> {
    if path.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("reading stdin")?;
        return Ok(buf);
    }
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
