use alarmpi_imager::{CancelToken, FileImage, ImageManifest, InstallConfig, DEFAULT_HOSTNAME};
use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::IsTerminal;
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const WIFI_PASSWORD_ENV: &str = "ALARMPI_WIFI_PASSWORD";

/// Install Arch Linux ARM on a Raspberry Pi SD card or USB drive
#[derive(Parser, Debug)]
#[clap(name = "alarmpi-imager", version, about)]
struct Args {
    /// Compressed (.xz) disk image to install
    #[clap(long)]
    image: PathBuf,

    /// Image manifest, defaults to `<image>.toml`
    #[clap(long)]
    manifest: Option<PathBuf>,

    /// List drives the image fits on and exit
    #[clap(long)]
    show_drives: bool,

    /// Drive to install to, as printed by --show-drives
    #[clap(long)]
    drive_path: Option<String>,

    #[clap(long, default_value = DEFAULT_HOSTNAME)]
    hostname: String,

    /// Wireless network to join on first boot
    #[clap(long)]
    wifi_network: Option<String>,

    /// Read the network password from ALARMPI_WIFI_PASSWORD
    #[clap(long)]
    wifi_has_password: bool,
}

/// Reports install progress either as a bar or as plain 10% steps
enum Progress {
    Bar(ProgressBar),
    Steps { next: u32 },
}

impl Progress {
    fn new() -> Result<Self> {
        if !std::io::stderr().is_terminal() {
            return Ok(Progress::Steps { next: 10 });
        }
        let bar = ProgressBar::new(100);
        bar.set_style(
            ProgressStyle::with_template("{spinner} [{elapsed_precise}] [{bar:40}] {pos:>3}%")?
                .progress_chars("=> "),
        );
        Ok(Progress::Bar(bar))
    }

    fn update(&mut self, percent: f64) {
        match self {
            Progress::Bar(bar) => bar.set_position(percent as u64),
            Progress::Steps { next } => {
                while *next <= 100 && percent >= f64::from(*next) {
                    eprintln!("{}%", next);
                    *next += 10;
                }
            }
        }
    }

    fn finish(&self) {
        if let Progress::Bar(bar) = self {
            bar.finish();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_file(true)
        .with_line_number(true)
        .init();

    run(args).await
}

#[cfg(target_os = "linux")]
async fn run(args: Args) -> Result<()> {
    use alarmpi_imager::Installer;
    use alarmpi_imager::disk::UDisks2Service;
    use std::sync::Arc;

    let manifest_path = args
        .manifest
        .clone()
        .unwrap_or_else(|| ImageManifest::sidecar_path(&args.image));
    let manifest = ImageManifest::load(&manifest_path)?;
    debug!("Loaded manifest {:?}: {:?}", manifest_path, manifest);

    let service = UDisks2Service::connect()
        .await
        .context("Failed to connect to UDisks2, is udisksd running?")?;
    let installer = Installer::new(
        Arc::new(service),
        Arc::new(FileImage::new(&args.image)),
        manifest,
    );

    if args.show_drives {
        let targets = installer.list_install_targets().await?;
        if targets.is_empty() {
            eprintln!("No drives large enough for this image");
        }
        for target in targets {
            println!("{}\t{}", target.label, target.id);
        }
        return Ok(());
    }

    let Some(drive) = args.drive_path.as_deref() else {
        anyhow::bail!("Nothing to do: pass --show-drives or --drive-path");
    };

    let password = if args.wifi_has_password {
        Some(std::env::var(WIFI_PASSWORD_ENV).with_context(|| {
            format!("--wifi-has-password given but {} is not set", WIFI_PASSWORD_ENV)
        })?)
    } else {
        None
    };
    let config = InstallConfig::new(&args.hostname, args.wifi_network.clone(), password)?;

    let cancel = CancelToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, cancelling install");
                cancel.cancel();
            }
        })
    };

    let mut progress = Progress::new()?;
    let result = installer
        .run_install(drive, &config, |p| progress.update(p), &cancel)
        .await;
    ctrl_c.abort();
    progress.finish();

    result?;
    info!("{} is ready, hostname {}", drive, config.hostname());
    Ok(())
}

#[cfg(not(target_os = "linux"))]
async fn run(_args: Args) -> Result<()> {
    anyhow::bail!("Installing requires UDisks2, which is only available on Linux")
}
