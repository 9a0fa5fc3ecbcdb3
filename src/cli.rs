use clap::Parser;

use crate::config::{PollerSettings, DEFAULT_PORT};

#[derive(Parser)]
#[command(name = "safetec-poller")]
#[command(version)]
#[command(about = "Polls a SYR/Safetec water-meter controller and publishes normalized snapshots")]
pub struct Args {
    /// Device host name or IP address
    #[arg(long)]
    pub host: Option<String>,

    /// Device HTTP port (device default 5333)
    #[arg(long)]
    pub port: Option<u16>,

    /// Seconds between poll cycles (minimum 5)
    #[arg(long)]
    pub interval: Option<u64>,

    /// TOML settings file; explicit flags override its values
    #[arg(long)]
    pub config: Option<String>,

    /// Print each published snapshot as a JSON line on stdout
    #[arg(long)]
    pub json: bool,
}

/// Merge the optional settings file with explicit CLI overrides.
pub fn build_settings(args: &Args) -> Result<PollerSettings, Box<dyn std::error::Error>> {
    let mut settings = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            PollerSettings::from_toml_str(&raw)?
        }
        None => PollerSettings::default(),
    };

    if let Some(host) = &args.host {
        settings.host = host.clone();
    }
    if let Some(port) = args.port {
        settings.port = port;
    }
    if let Some(interval) = args.interval {
        settings.scan_interval_seconds = interval;
    }
    if settings.port == 0 {
        settings.port = DEFAULT_PORT;
    }

    settings.validate()?;
    Ok(settings)
}
