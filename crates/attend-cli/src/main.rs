use anyhow::{bail, Context, Result};
use attend_core::{
    default_data_dir, load_gallery, CsvDayStore, FrameSource, LedgerStore, NamingConvention,
};
use attend_hw::Camera;
use attend_vision::OnnxExtractor;
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use zbus::proxy;

#[proxy(
    interface = "org.attend.Attendance1",
    default_service = "org.attend.Attendance1",
    default_path = "/org/attend/Attendance1"
)]
trait Attendance {
    fn status(&self) -> zbus::Result<String>;
    fn present(&self) -> zbus::Result<String>;
    fn mark(&self, identity: &str) -> zbus::Result<bool>;
}

#[derive(Parser)]
#[command(name = "attend", about = "Webcam attendance marker CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Naming {
    Stem,
    Prefix,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status
    Status,
    /// List everyone marked present today
    Present,
    /// Mark a person present without the camera
    Mark {
        /// Identity as it appears in the gallery
        identity: String,
    },
    /// Load the gallery offline and report what was recognised
    Gallery {
        /// Gallery directory (default: ~/.local/share/attend/gallery)
        #[arg(long)]
        dir: Option<PathBuf>,
        /// ONNX model directory (default: ~/.local/share/attend/models)
        #[arg(long)]
        models: Option<PathBuf>,
        #[arg(long, value_enum, default_value = "prefix")]
        naming: Naming,
        #[arg(long, default_value_t = '_')]
        separator: char,
    },
    /// Print a day's ledger straight from disk
    Ledger {
        /// Day to show, YYYY-MM-DD (default: today)
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Ledger directory (default: ~/.local/share/attend/ledger)
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// List capture devices
    Devices,
    /// Grab a few frames from a camera to check it works
    Test {
        #[arg(long, default_value = "/dev/video0")]
        device: String,
        #[arg(long, default_value_t = 10)]
        frames: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Status => {
            let proxy = connect().await?;
            let status = proxy.status().await.context("Status call failed")?;
            print_json(&status)?;
        }
        Commands::Present => {
            let proxy = connect().await?;
            let present = proxy.present().await.context("Present call failed")?;
            let records: Vec<serde_json::Value> = serde_json::from_str(&present)?;
            if records.is_empty() {
                println!("Nobody marked present yet today");
            }
            for r in records {
                println!(
                    "{:<24} {}  {}",
                    r["identity"].as_str().unwrap_or("?"),
                    r["time"].as_str().unwrap_or("?"),
                    r["method"].as_str().unwrap_or("?")
                );
            }
        }
        Commands::Mark { identity } => {
            let proxy = connect().await?;
            if proxy.mark(&identity).await.context("Mark call failed")? {
                println!("{identity}: marked present");
            } else {
                println!("{identity}: already present today");
            }
        }
        Commands::Gallery {
            dir,
            models,
            naming,
            separator,
        } => {
            let dir = dir.unwrap_or_else(|| default_data_dir().join("gallery"));
            let models = models.unwrap_or_else(|| default_data_dir().join("models"));
            let naming = match naming {
                Naming::Stem => NamingConvention::Stem,
                Naming::Prefix => NamingConvention::Prefix(separator),
            };

            let mut extractor = OnnxExtractor::load(&models)
                .with_context(|| format!("failed to load models from {}", models.display()))?;
            let gallery = load_gallery(&dir, naming, &mut extractor)?;

            println!("{} reference faces, {} people", gallery.len(), gallery.identities().len());
            for identity in gallery.identities() {
                let count = gallery
                    .entries()
                    .iter()
                    .filter(|e| e.identity == identity)
                    .count();
                println!("  {identity:<24} {count}");
            }
            for skipped in gallery.skipped() {
                println!("  skipped {}: {}", skipped.path.display(), skipped.reason);
            }
        }
        Commands::Ledger { date, dir } => {
            let dir = dir.unwrap_or_else(|| default_data_dir().join("ledger"));
            let date = date.unwrap_or_else(|| chrono::Local::now().date_naive());
            let mut store = CsvDayStore::new(dir);
            tracing::debug!(path = %store.path_for(date).display(), "reading ledger");
            let records = store.load_day(date)?;
            println!("{} ({} present)", store.path_for(date).display(), records.len());
            for r in records {
                println!("  {:<24} {}  {}", r.identity, r.time, r.method.as_str());
            }
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for d in devices {
                println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
            }
        }
        Commands::Test { device, frames } => {
            let camera = Camera::open(&device)?;
            println!("{device}: {}x{} {:?}", camera.width, camera.height, camera.fourcc);
            let mut stream = camera.stream()?;
            let mut grabbed = 0;
            for attempt in 0..frames {
                let capture = stream.grab()?;
                tracing::debug!(attempt, capture = capture_kind(&capture), "grab returned");
                if let attend_core::Capture::Frame(frame) = capture {
                    grabbed += 1;
                    let mean = frame.data.iter().map(|&p| p as f32).sum::<f32>()
                        / frame.data.len().max(1) as f32;
                    println!("  frame {:>4}: mean brightness {mean:.1}", frame.sequence);
                }
            }
            if grabbed == 0 {
                bail!("no frames captured from {device}");
            }
        }
    }

    Ok(())
}

async fn connect() -> Result<AttendanceProxy<'static>> {
    tracing::debug!(service = "org.attend.Attendance1", "connecting to session bus");
    let conn = zbus::Connection::session()
        .await
        .context("cannot connect to the session bus")?;
    AttendanceProxy::new(&conn)
        .await
        .context("attendd is not running")
}

fn capture_kind(capture: &attend_core::Capture) -> &'static str {
    match capture {
        attend_core::Capture::Frame(_) => "frame",
        attend_core::Capture::NotReady => "not_ready",
        attend_core::Capture::Exhausted => "exhausted",
    }
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
