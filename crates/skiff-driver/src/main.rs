//! Skiff echo server.
//!
//! Accepts TLS (and optionally plaintext) connections and writes every
//! received byte straight back.
//!
//! # Usage
//!
//! ```bash
//! # Self-signed certificate, TLS only
//! skiff-echo --bind 127.0.0.1:5671
//!
//! # Real certificate, plaintext clients let through
//! skiff-echo --bind 0.0.0.0:amqps --cert cert.pem --key key.pem --allow-insecure
//!
//! # Exit after three connections have come and gone
//! skiff-echo --max-connections 3
//! ```

use std::{path::PathBuf, sync::Arc, time::Instant};

use clap::Parser;
use skiff_driver::{
    Connector, Driver, DriverConfig, Engine, EngineError, ServerSecurity, ServerSecurityConfig,
    Trace,
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Skiff echo server
#[derive(Parser, Debug)]
#[command(name = "skiff-echo")]
#[command(about = "Echo server on the skiff connection driver")]
#[command(version)]
struct Args {
    /// Address to bind to; the port may be `amqp` or `amqps`
    #[arg(short, long, default_value = "0.0.0.0:5671")]
    bind: String,

    /// Path to TLS certificate (PEM format)
    #[arg(short, long)]
    cert: Option<PathBuf>,

    /// Path to TLS private key (PEM format)
    #[arg(short, long)]
    key: Option<PathBuf>,

    /// Let clients that do not start a TLS handshake through in plaintext
    #[arg(long)]
    allow_insecure: bool,

    /// Exit once this many connections have closed
    #[arg(long)]
    max_connections: Option<usize>,

    /// Trace raw bytes and driver events for every connection
    #[arg(long)]
    trace: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Echoes input back until the peer stops sending.
#[derive(Debug, Default)]
struct EchoEngine {
    pending: Vec<u8>,
    input_closed: bool,
}

impl Engine for EchoEngine {
    fn input(&mut self, bytes: &[u8]) -> Result<usize, EngineError> {
        self.pending.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn input_closed(&mut self) {
        self.input_closed = true;
    }

    fn pending_output(&mut self) -> &[u8] {
        &self.pending
    }

    fn output_consumed(&mut self, count: usize) {
        self.pending.drain(..count);
    }

    fn next_tick(&self) -> Option<Instant> {
        None
    }

    fn tick(&mut self, _now: Instant) {}

    fn wants_close(&self) -> bool {
        self.input_closed
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("Skiff echo server starting");

    let (host, port) = args.bind.rsplit_once(':').ok_or("bind address must be host:port")?;

    let security = match (&args.cert, &args.key) {
        (Some(cert), Some(key)) => ServerSecurity::load(&ServerSecurityConfig {
            certificate_file: cert.clone(),
            private_key_file: key.clone(),
            ..Default::default()
        })?,
        _ => {
            tracing::info!("No TLS certificate provided");
            ServerSecurity::self_signed(vec!["localhost".to_string()])?
        },
    };

    let trace = if args.trace { Trace::RAW | Trace::DRIVER } else { Trace::OFF };
    let mut driver: Driver<EchoEngine> = Driver::new(DriverConfig { trace, ..Default::default() })?;

    let listener_id = driver.listen(host, port, ())?;
    let listener = driver.listener_mut(listener_id).ok_or("listener missing after listen")?;
    listener.set_security(Arc::new(security));
    if args.allow_insecure {
        listener.allow_unsecured_clients();
    }
    tracing::info!("Server listening on {}", listener.local_addr());

    let mut served = 0usize;
    loop {
        driver.wait(None)?;

        while let Some(id) = driver.next_pending_listener() {
            while let Some(connector_id) = driver.accept(id) {
                if let Some(connector) = driver.connector_mut(connector_id) {
                    connector.set_connection(EchoEngine::default());
                }
            }
        }

        while let Some(id) = driver.next_pending_connector() {
            if driver.connector(id).is_some_and(Connector::is_closed) {
                driver.free_connector(id);
                served += 1;
                if args.max_connections.is_some_and(|max| served >= max) {
                    tracing::info!(served, "Connection limit reached, exiting");
                    return Ok(());
                }
            } else {
                driver.process(id)?;
            }
        }
    }
}
