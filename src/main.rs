//! Mock HTTP Server - CLI Entry Point

use anyhow::Result;
use clap::Parser;
use mock_http_server::{MockServer, MockServerConfig, ServerOptions};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    name = "mock-http-server",
    about = "Rule-driven mock HTTP server - request matching, response templates and fault injection",
    version
)]
struct Args {
    /// Path to the rules file
    #[arg(short, long, env = "MOCK_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address
    #[arg(short, long, env = "MOCK_ADDR", default_value = "localhost:8080")]
    addr: String,

    /// TLS certificate file (PEM), requires --tls-key
    #[arg(long, env = "MOCK_TLS_CERT", requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// TLS key file (PEM), requires --tls-cert
    #[arg(long, env = "MOCK_TLS_KEY", requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Seconds allowed for reading a request body (0 = unbounded)
    #[arg(long, default_value_t = 5.0)]
    read_timeout: f64,

    /// Seconds allowed for producing a response (0 = unbounded)
    #[arg(long, default_value_t = 5.0)]
    write_timeout: f64,

    /// Fraction of requests to delay, in [0, 1]
    #[arg(long, default_value_t = 0.0)]
    delay_participation: f32,

    /// Delay applied to participating requests, in milliseconds
    #[arg(long, default_value_t = 0)]
    delay_duration_ms: u64,

    /// Fraction of requests to fail, in [0, 1]
    #[arg(long, default_value_t = 0.0)]
    fault_participation: f32,

    /// Status code returned by failed requests
    #[arg(long, default_value_t = 500)]
    fault_error_code: u16,

    /// Exit when a request matches no rule
    #[arg(long, env = "MOCK_EXIT_ON_UNMATCHED_RULE")]
    exit_on_unmatched_rule: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Print a sample rules file and exit
    #[arg(long)]
    print_config: bool,

    /// Validate the rules file and exit
    #[arg(long)]
    validate: bool,
}

impl Args {
    fn server_options(&self) -> Result<ServerOptions> {
        Ok(ServerOptions {
            addr: self.addr.clone(),
            tls_certificate: self.tls_cert.clone(),
            tls_key: self.tls_key.clone(),
            read_timeout: seconds("read timeout", self.read_timeout)?,
            write_timeout: seconds("write timeout", self.write_timeout)?,
            config_path: self.config.clone(),
            delay_participation: self.delay_participation,
            delay_duration: Duration::from_millis(self.delay_duration_ms),
            fault_participation: self.fault_participation,
            fault_error_code: self.fault_error_code,
            exit_on_unmatched_rule: self.exit_on_unmatched_rule,
            ..Default::default()
        })
    }
}

fn seconds(name: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|e| anyhow::anyhow!("invalid {}: {} ({})", name, value, e))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if args.print_config {
        let default_config = include_str!("../demos/default-config.yaml");
        println!("{}", default_config);
        return Ok(());
    }

    if args.validate {
        let Some(path) = &args.config else {
            anyhow::bail!("--validate requires --config");
        };
        let config = MockServerConfig::from_file(path)?;
        // Compiling catches bad patterns, regexes and templates
        mock_http_server::Dispatcher::new(&config, false)?;
        println!(
            "Configuration is valid ({} rules defined)",
            config.rules.len()
        );
        return Ok(());
    }

    let mut server = MockServer::new(args.server_options()?)?;
    let addr = server.start().await?;
    info!(%addr, "Mock server started, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    server.close().await?;

    Ok(())
}
