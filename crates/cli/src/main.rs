use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use gbsim::transport::{BatchPolicy, SignalingProtocol};
use gbsim::{DeviceAgent, DeviceConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gbsim", about = "GB28181 device simulator")]
struct Args {
    /// Platform signaling address (host:port)
    #[arg(long, short, default_value = "127.0.0.1:5060")]
    server: String,

    /// Signaling transport (udp or tcp)
    #[arg(long, default_value = "udp")]
    protocol: SignalingProtocol,

    /// Device id (20 digits)
    #[arg(long, short, default_value = "34020000001320000001")]
    id: String,

    /// Platform id (20 digits)
    #[arg(long, default_value = "34020000002000000001")]
    server_id: String,

    /// SIP domain
    #[arg(long, default_value = "3402000000")]
    realm: String,

    /// Channel id reported in the catalog (repeatable)
    #[arg(long = "channel", default_value = "34020000001310000001")]
    channels: Vec<String>,

    /// Keepalive interval in seconds
    #[arg(long, default_value_t = 60)]
    keepalive: u64,

    /// REGISTER expiry in seconds
    #[arg(long, default_value_t = 3600)]
    expires: u32,

    /// PS file replayed to every call
    #[arg(long, short, default_value = "test.dat")]
    media: PathBuf,

    /// Write media to this file instead of sending it
    #[arg(long)]
    record: Option<PathBuf>,

    /// Probability of coalescing MANSCDP messages into one write
    #[arg(long, default_value_t = 0.0)]
    batch_probability: f64,

    /// Number of earlier messages repeated in a coalesced write
    #[arg(long, default_value_t = 3)]
    batch_depth: usize,

    /// Verbose logging
    #[arg(long, short)]
    verbose: bool,
}

impl Args {
    fn into_config(self) -> DeviceConfig {
        DeviceConfig {
            server_addr: self.server,
            protocol: self.protocol,
            device_id: self.id,
            server_id: self.server_id,
            realm: self.realm,
            channels: self.channels,
            keepalive_interval: Duration::from_secs(self.keepalive.max(1)),
            register_expires: self.expires,
            media_file: self.media,
            record_to: self.record,
            batch: BatchPolicy {
                probability: self.batch_probability.clamp(0.0, 1.0),
                depth: self.batch_depth,
                ..BatchPolicy::default()
            },
            ..DeviceConfig::default()
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    let config = args.into_config();
    tracing::info!(device_id = %config.device_id, server = %config.server_addr, "gb28181 simulator starting");

    let agent = match DeviceAgent::connect(config) {
        Ok(agent) => agent,
        Err(e) => {
            tracing::error!(error = %e, "failed to open signaling transport");
            return ExitCode::FAILURE;
        }
    };

    match agent.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "device agent failed");
            ExitCode::FAILURE
        }
    }
}
