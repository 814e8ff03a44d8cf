use clap::Parser;
use growatt_broker::config::{parse_host_port, BrokerConfig, SerialSettings};
use growatt_broker::{broker, BrokerError, SerialFormat};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "growatt-broker")]
#[command(about = "Shine serial + Modbus-TCP -> single RTU master for a Growatt inverter")]
struct Args {
    /// Downstream RS-485 serial device (to inverter)
    #[arg(long)]
    inverter: String,

    /// Upstream ShineWiFi-X serial device (omit if not present)
    #[arg(long)]
    shine: Option<String>,

    /// Default baud if side-specific not set
    #[arg(long, default_value_t = 9600)]
    baud: u32,

    /// Default serial format if side-specific not set, e.g. 8E1
    #[arg(long = "bytes", default_value = "8E1", value_parser = SerialFormat::parse)]
    bytes: SerialFormat,

    /// Inverter baudrate
    #[arg(long)]
    inv_baud: Option<u32>,

    /// Inverter format, e.g. 8E1
    #[arg(long, value_parser = SerialFormat::parse)]
    inv_bytes: Option<SerialFormat>,

    /// Shine baudrate
    #[arg(long)]
    shine_baud: Option<u32>,

    /// Shine format, e.g. 8E1
    #[arg(long, value_parser = SerialFormat::parse)]
    shine_bytes: Option<SerialFormat>,

    /// Bind host:port for the primary Modbus-TCP server (use '-' to disable)
    #[arg(long, default_value = "0.0.0.0:5020")]
    tcp: String,

    /// Optional secondary Modbus-TCP server for lab/tools (use '-' to disable)
    #[arg(long)]
    tcp_alt: Option<String>,

    /// Optional host:port for the streaming JSONL sniff feed (use '-' to disable)
    #[arg(long)]
    sniff: Option<String>,

    /// Minimum seconds between downstream transactions
    #[arg(long, default_value_t = 1.0)]
    min_period: f64,

    /// RTU read timeout seconds
    #[arg(long, default_value_t = 1.5)]
    rtimeout: f64,

    /// JSONL wire log path (use '-' to disable)
    #[arg(long, default_value = "/var/log/growatt_broker.jsonl")]
    log: String,
}

fn spec_enabled(spec: &str) -> bool {
    !spec.is_empty() && spec != "-"
}

fn build_config(args: &Args) -> std::result::Result<BrokerConfig, String> {
    let inverter = SerialSettings {
        device: args.inverter.clone(),
        baud: args.inv_baud.unwrap_or(args.baud),
        format: args.inv_bytes.unwrap_or(args.bytes),
    };
    let shine = args.shine.as_ref().map(|device| SerialSettings {
        device: device.clone(),
        baud: args.shine_baud.unwrap_or(args.baud),
        format: args.shine_bytes.unwrap_or(args.bytes),
    });

    let mut tcp_binds = Vec::new();
    if spec_enabled(&args.tcp) {
        tcp_binds.push(parse_host_port(&args.tcp)?);
    }
    if let Some(alt) = args.tcp_alt.as_deref().filter(|s| spec_enabled(s)) {
        tcp_binds.push(parse_host_port(alt)?);
    }
    if tcp_binds.is_empty() {
        return Err("at least one TCP server must be configured (set --tcp or --tcp-alt)".into());
    }

    let sniff_bind = match args.sniff.as_deref().filter(|s| spec_enabled(s)) {
        Some(spec) => Some(parse_host_port(spec)?),
        None => None,
    };

    Ok(BrokerConfig {
        inverter,
        shine,
        tcp_binds,
        sniff_bind,
        min_period: Duration::from_secs_f64(args.min_period.max(0.0)),
        read_timeout: Duration::from_secs_f64(args.rtimeout.max(0.0)),
        log_path: spec_enabled(&args.log).then(|| PathBuf::from(&args.log)),
    })
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let Ok(mut term) = signal(SignalKind::terminate()) else {
            tokio::signal::ctrl_c().await.ok();
            return;
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let args = Args::parse();
    let config = build_config(&args).map_err(BrokerError::Config)?;

    let cancel = CancellationToken::new();
    let cancel_signal = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Received shutdown signal");
        cancel_signal.cancel();
    });

    broker::run(config, cancel).await?;
    tracing::info!("Shutdown complete");
    Ok(())
}
