use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;

#[zbus::proxy(
    interface = "org.waypoint.Recognizer1",
    default_service = "org.waypoint.Recognizer1",
    default_path = "/org/waypoint/Recognizer1"
)]
trait Recognizer {
    async fn detect(&self, image: &[u8]) -> zbus::Result<String>;
    async fn submit_frame(&self, image: &[u8]) -> zbus::Result<bool>;
    async fn acknowledge(&self) -> zbus::Result<()>;
    async fn reload(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
    async fn list_places(&self) -> zbus::Result<String>;

    #[zbus(signal)]
    fn place_detected(&self, result: String) -> zbus::Result<()>;
}

#[derive(Parser)]
#[command(name = "waypoint", about = "Waypoint place recognition CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Recognize the place shown in an image
    Detect {
        /// Image file (JPEG, PNG, ...)
        image: PathBuf,
    },
    /// Feed an image to the daemon's detection loop
    Submit {
        image: PathBuf,
    },
    /// Acknowledge the last detection so the next one is announced
    Ack,
    /// Rebuild the reference catalog from the photo store
    Reload,
    /// Show daemon status
    Status,
    /// List cataloged places
    Places,
    /// Print detections as they are announced
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("connecting to D-Bus")?;
    let proxy = RecognizerProxy::new(&conn)
        .await
        .context("waypointd is not reachable")?;

    match cli.command {
        Commands::Detect { image } => {
            let bytes = read_image(&image)?;
            print_json(&proxy.detect(&bytes).await?)?;
        }
        Commands::Submit { image } => {
            let bytes = read_image(&image)?;
            if proxy.submit_frame(&bytes).await? {
                println!("Frame accepted");
            } else {
                println!("Frame dropped (detection loop busy)");
            }
        }
        Commands::Ack => {
            proxy.acknowledge().await?;
            println!("Acknowledged");
        }
        Commands::Reload => {
            println!("Reloading reference catalog...");
            print_json(&proxy.reload().await?)?;
        }
        Commands::Status => {
            print_json(&proxy.status().await?)?;
        }
        Commands::Places => {
            let places: serde_json::Value = serde_json::from_str(&proxy.list_places().await?)?;
            match places.as_array() {
                Some(list) if !list.is_empty() => {
                    for place in list {
                        println!("{}\t{} reference(s)", place["id"].as_str().unwrap_or("?"), place["references"]);
                    }
                }
                _ => println!("No places cataloged"),
            }
        }
        Commands::Watch => {
            let mut detections = proxy.receive_place_detected().await?;
            println!("Watching for detections (Ctrl-C to stop)...");
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    signal = detections.next() => {
                        let Some(signal) = signal else { break };
                        let args = signal.args()?;
                        print_json(args.result())?;
                    }
                }
            }
        }
    }

    Ok(())
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
