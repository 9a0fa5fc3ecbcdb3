use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use safetec_poller::cli::{self, Args};
use safetec_poller::normalize::TelemetryValue;
use safetec_poller::poller::Poller;
use safetec_poller::state::DeviceSnapshot;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let settings = cli::build_settings(&args)?;
    info!(host = %settings.host, port = settings.port, "starting safetec-poller");

    let handle = Poller::new(settings)?.start();

    let mut snapshots = handle.subscribe();
    let json = args.json;
    let printer = tokio::spawn(async move {
        while snapshots.changed().await.is_ok() {
            let snapshot = snapshots.borrow_and_update().clone();
            if json {
                match serde_json::to_string(&*snapshot) {
                    Ok(line) => println!("{line}"),
                    Err(e) => error!(error = %e, "failed to serialize snapshot"),
                }
            } else {
                info!("{}", summarize(&snapshot));
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    handle.shutdown().await?;
    printer.abort();
    Ok(())
}

/// One-line human summary of a snapshot for the default (non-JSON) output.
fn summarize(snapshot: &DeviceSnapshot) -> String {
    let mut parts = vec![format!("cycle {}", snapshot.cycle)];
    for key in ["vol", "flo", "bar", "cel", "vlv"] {
        if let Some(state) = snapshot.get_value(key) {
            let rendered = match (&state.value, state.available) {
                (Some(TelemetryValue::Number { value }), true) => {
                    format!("{key}={value}{}", state.unit)
                }
                (Some(TelemetryValue::Code { code, label }), true) => {
                    format!("{key}={}", label.as_deref().unwrap_or(code))
                }
                (Some(TelemetryValue::Text { value }), true) => format!("{key}={value}"),
                (Some(_), false) => format!("{key}=stale"),
                (None, _) => format!("{key}=?"),
            };
            parts.push(rendered);
        }
    }
    if let Some(hourly) = snapshot.hourly_consumption {
        parts.push(format!("hourly={hourly}L"));
    }
    if let Some(err) = &snapshot.last_error {
        parts.push(format!("error[{err}]"));
    }
    parts.join(" ")
}
