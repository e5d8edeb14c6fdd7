//! Switchyard broker daemon
//!
//! Runs until SIGINT or SIGTERM.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use switchyard::logging::init_tracing;
use switchyard::{Broker, BrokerConfig, KeyPair};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "switchyard-broker")]
#[command(about = "Channel discovery broker", long_about = None)]
struct Cli {
    /// JSON config file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Endpoint to bind, e.g. tcp://0.0.0.0:5550
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Z85 public key (generated when omitted)
    #[arg(long, requires = "secret_key")]
    public_key: Option<String>,

    /// Z85 secret key
    #[arg(long, requires = "public_key")]
    secret_key: Option<String>,

    /// Close ready channels silent for this long
    #[arg(long)]
    heartbeat_timeout_ms: Option<u64>,

    /// Print a fresh key pair and exit
    #[arg(long)]
    generate_keys: bool,
}

impl Cli {
    fn broker_config(&self) -> switchyard::Result<BrokerConfig> {
        let mut config = match &self.config {
            Some(path) => BrokerConfig::from_json_file(path)?,
            None => BrokerConfig::default(),
        };
        if let Some(endpoint) = &self.endpoint {
            config.endpoint = endpoint.clone();
        }
        if let (Some(public), Some(secret)) = (&self.public_key, &self.secret_key) {
            config.public_key = public.clone();
            config.secret_key = secret.clone();
        }
        if let Some(timeout) = self.heartbeat_timeout_ms {
            config.heartbeat_timeout_ms = timeout;
        }
        Ok(config)
    }
}

fn run(cli: &Cli, stop: &AtomicBool) -> switchyard::Result<()> {
    if cli.generate_keys {
        let keys = KeyPair::generate()?;
        println!("public_key = {}", keys.public_key);
        println!("secret_key = {}", keys.secret_key);
        return Ok(());
    }

    let config = cli.broker_config()?;
    let mut broker = Broker::bind(config)?;
    info!(endpoint = broker.endpoint(), public_key = broker.public_key(), "Broker started");

    broker.run(stop)
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let stop = Arc::new(AtomicBool::new(false));
    let on_signal = Arc::clone(&stop);
    if let Err(e) = ctrlc::set_handler(move || on_signal.store(true, Ordering::Release)) {
        error!(error = %e, "Failed to install signal handler");
        eprintln!("switchyard-broker: {}", e);
        return ExitCode::FAILURE;
    }

    match run(&cli, &stop) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Broker failed");
            eprintln!("switchyard-broker: {}", e);
            ExitCode::FAILURE
        }
    }
}
