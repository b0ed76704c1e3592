pub mod config;
pub mod control;
pub mod error;
pub mod logging;
pub mod midi;
pub mod playback;
pub mod rpc;
pub mod server;
pub mod tracker;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use config::ServerConfig;
use error::ServerError;
use server::MidiServer;

const USAGE: &str = "Usage: midimcp [--config <path>]

Serves MIDI device control over line-delimited JSON-RPC (stdio by default).

Options:
  -c, --config <path>  Configuration file (JSON)
  -V, --version        Print version
  -h, --help           Print this help

Environment:
  MIDIMCP_CONFIG, MIDIMCP_BACKEND, MIDIMCP_PORT, MIDIMCP_LISTEN,
  MIDIMCP_LOG_LEVEL, RUST_LOG";

#[derive(Debug, PartialEq)]
enum Command {
    Serve { config: Option<PathBuf> },
    Help,
    Version,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Command, ServerError> {
    let mut config = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(Command::Help),
            "-V" | "--version" => return Ok(Command::Version),
            "-c" | "--config" => {
                let path = args
                    .next()
                    .ok_or_else(|| ServerError::Config(format!("{} needs a path", arg)))?;
                config = Some(PathBuf::from(path));
            }
            other => {
                if let Some(path) = other.strip_prefix("--config=") {
                    config = Some(PathBuf::from(path));
                } else {
                    return Err(ServerError::Config(format!(
                        "unknown argument '{}'\n\n{}",
                        other, USAGE
                    )));
                }
            }
        }
    }
    Ok(Command::Serve { config })
}

/// Entry point for the `midimcp` binary
pub fn run() -> Result<(), ServerError> {
    let config_path = match parse_args(std::env::args().skip(1))? {
        Command::Serve { config } => config,
        Command::Help => {
            println!("{}", USAGE);
            return Ok(());
        }
        Command::Version => {
            println!("midimcp {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
    };

    let config = ServerConfig::load(config_path.as_deref())?;
    logging::init_logging(&config);
    if let Some(path) = logging::log_file_path() {
        log::info!("Logging to {}", path.display());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("midimcp-rt")
        .build()?;
    let result = runtime.block_on(serve(config));
    // stdin reads park a blocking thread that never returns on its own
    runtime.shutdown_timeout(Duration::from_millis(500));
    result
}

/// Serve until stdin closes, the listener fails or Ctrl+C
pub async fn serve(config: ServerConfig) -> Result<(), ServerError> {
    let server = Arc::new(MidiServer::from_config(config));
    server.connect_default_port();

    let listen = server.config().listen.clone();
    let stdio = server.config().stdio;

    let tcp = async {
        match listen {
            Some(addr) => rpc::serve_tcp(Arc::clone(&server), &addr).await,
            None => std::future::pending().await,
        }
    };
    let stdin = async {
        if stdio {
            rpc::serve_stdio(Arc::clone(&server)).await
        } else {
            std::future::pending().await
        }
    };

    let result = tokio::select! {
        result = stdin => {
            log::info!("stdin closed");
            result
        }
        result = tcp => result,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Interrupted");
            Ok(())
        }
    };

    server.shutdown();
    result.map_err(ServerError::from)
}
