use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use weighin_core::{Embedding, StabilityConfig};
use weighin_hw::Scenario;

mod replay;

#[zbus::proxy(
    interface = "org.weighin.Scales1",
    default_service = "org.weighin.Scales1",
    default_path = "/org/weighin/Scales1"
)]
trait Scales {
    fn identify(&self, embedding: &[f64], faces: u32) -> zbus::Result<String>;
    fn enroll(&self, name: &str, embedding: &[f64]) -> zbus::Result<String>;
    fn refresh(&self) -> zbus::Result<u32>;
    fn status(&self) -> zbus::Result<String>;
    fn list_identities(&self) -> zbus::Result<String>;
    fn history(&self, identity_id: i64, days: u32) -> zbus::Result<String>;
    fn remove(&self, identity_id: i64) -> zbus::Result<bool>;
}

#[derive(Parser)]
#[command(name = "weighin", about = "weighin smart scale CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session_bus: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a new person from a face embedding
    Enroll {
        name: String,
        /// JSON array of floats
        #[arg(short, long)]
        embedding: PathBuf,
    },
    /// Identify the person on the scale
    Identify {
        #[arg(short, long)]
        embedding: PathBuf,
        /// Faces the detector found in the frame
        #[arg(long, default_value_t = 1)]
        faces: u32,
    },
    /// List enrolled people
    List,
    /// Show recent measurements and weight change for a person
    History {
        id: i64,
        #[arg(long, default_value_t = 30)]
        days: u32,
    },
    /// Deactivate an enrolled person (history is kept)
    Remove { id: i64 },
    /// Reload the daemon's identity cache from its database
    Refresh,
    /// Show daemon status
    Status,
    /// Run a scenario file through the matcher and stability tracker offline
    Replay {
        scenario: PathBuf,
        /// Identify a single synthetic person from this embedding first
        #[arg(short, long)]
        embedding: Option<PathBuf>,
        #[arg(long, default_value_t = 0.6)]
        threshold: f32,
        #[arg(long, default_value_t = 0.2)]
        epsilon: f32,
        #[arg(long, default_value_t = 3000)]
        settle_ms: u64,
        #[arg(long, default_value_t = 10.0)]
        min_weight: f32,
    },
}

fn read_embedding(path: &Path) -> Result<Vec<f64>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let values: Vec<f64> = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a JSON array of numbers", path.display()))?;
    Ok(values)
}

fn print_json(raw: &str) {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) => println!(
            "{}",
            serde_json::to_string_pretty(&value).unwrap_or_else(|_| raw.to_string())
        ),
        Err(_) => println!("{raw}"),
    }
}

async fn connect(session_bus: bool) -> Result<ScalesProxy<'static>> {
    tracing::debug!(session_bus, "connecting to weighind");
    let conn = if session_bus {
        zbus::Connection::session().await?
    } else {
        zbus::Connection::system().await?
    };
    ScalesProxy::new(&conn)
        .await
        .context("weighind is not reachable on D-Bus")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Replay {
            scenario,
            embedding,
            threshold,
            epsilon,
            settle_ms,
            min_weight,
        } => {
            let stability = StabilityConfig {
                epsilon,
                settle_duration: Duration::from_millis(settle_ms),
                min_plausible_weight: min_weight,
            };
            run_replay(&scenario, embedding.as_deref(), stability, threshold)
        }
        command => run_remote(cli.session_bus, command).await,
    }
}

fn run_replay(
    scenario: &Path,
    embedding: Option<&Path>,
    stability: StabilityConfig,
    threshold: f32,
) -> Result<()> {
    let scenario = Scenario::load(scenario)?;
    let probe = match embedding {
        Some(path) => Some(Embedding::new(
            read_embedding(path)?.into_iter().map(|v| v as f32).collect(),
        )),
        None => None,
    };
    let report = replay::replay(&scenario, probe, stability, threshold, chrono::Utc::now())?;
    for n in &report.notifications {
        println!("{}", n.to_json());
    }
    for (weight, reason) in &report.discarded {
        println!("discarded settled weight {weight:.1} kg: {reason:?}");
    }
    println!("{} measurement(s) recorded", report.measurements.len());
    Ok(())
}

async fn run_remote(session_bus: bool, command: Commands) -> Result<()> {
    let proxy = connect(session_bus).await?;

    match command {
        Commands::Enroll { name, embedding } => {
            let values = read_embedding(&embedding)?;
            print_json(&proxy.enroll(&name, &values).await?);
        }
        Commands::Identify { embedding, faces } => {
            let values = read_embedding(&embedding)?;
            print_json(&proxy.identify(&values, faces).await?);
        }
        Commands::List => print_json(&proxy.list_identities().await?),
        Commands::History { id, days } => print_json(&proxy.history(id, days).await?),
        Commands::Remove { id } => {
            if proxy.remove(id).await? {
                println!("Removed identity {id}");
            } else {
                println!("No active identity {id}");
            }
        }
        Commands::Refresh => {
            let loaded = proxy.refresh().await?;
            println!("Identity cache reloaded: {loaded} entries");
        }
        Commands::Status => print_json(&proxy.status().await?),
        Commands::Replay { .. } => anyhow::bail!("replay runs offline"),
    }

    Ok(())
}
