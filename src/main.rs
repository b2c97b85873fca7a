use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::LevelFilter;

use ctftp::config::ServerConfig;
use ctftp::events::EventPipeline;
use ctftp::server;

/// A multi-listener, read-only TFTP server with structured transfer events.
#[derive(Parser, Debug)]
#[command(name = "ctftp", version, about)]
struct Cli {
    /// Path to the configuration file. Missing file means built-in
    /// defaults.
    #[arg(default_value = "ctftp.conf")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let cfg = Arc::new(ServerConfig::load(&cli.config));

    init_logging(&cfg);
    info!("ctftp starting with config {}", cli.config.display());

    let events = EventPipeline::new(&cfg);

    let result = server::run(Arc::clone(&cfg), events.clone()).await;
    events.shutdown().await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("startup failed: {e:#}");
            eprintln!("ctftp: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Log to `<log_dir>/ctftp.log`, append-only; fall back to stderr when
/// the log directory is unusable.
fn init_logging(cfg: &ServerConfig) {
    let level: LevelFilter = cfg.log_level.into();
    let _ = std::fs::create_dir_all(&cfg.log_dir);

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix("ctftp.log")
        .build(&cfg.log_dir);

    match appender {
        Ok(writer) => tracing_subscriber::fmt()
            .with_max_level(level)
            .with_ansi(false)
            .with_writer(writer)
            .init(),
        Err(e) => {
            eprintln!(
                "ctftp: cannot open log file in {}: {e}; logging to stderr",
                cfg.log_dir.display()
            );
            tracing_subscriber::fmt()
                .with_max_level(level)
                .with_ansi(false)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}
