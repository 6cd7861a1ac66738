use std::env;
use std::io;
use std::path::Path;
use std::process::ExitCode;

use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;
use wallet_eng::csv::{read_requests, write_accounts};
use wallet_eng::{Engine, EngineConfig};

#[tokio::main]
async fn main() -> ExitCode {
    let mut args = env::args().skip(1);
    let Some(path) = args.next() else {
        eprintln!("usage: wallet-eng <requests.csv> [config.yaml]");
        return ExitCode::from(2);
    };

    let config = match args.next() {
        Some(config_path) => match EngineConfig::from_file(&config_path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{e}");
                return ExitCode::from(2);
            }
        },
        None => EngineConfig::default(),
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    if !path.ends_with(".csv") {
        warn!(path, "input file seems to not be a csv file");
    }

    let requests = match read_requests(Path::new(&path)) {
        Ok(requests) => requests,
        Err(e) => {
            error!(path, "{e}");
            return ExitCode::FAILURE;
        }
    };

    let engine = match Engine::open(config) {
        Ok(engine) => engine,
        Err(e) => {
            error!("failed to open ledger: {e}");
            return ExitCode::FAILURE;
        }
    };

    let (req_sender, req_receiver) = tokio::sync::mpsc::channel(16);

    let reader = tokio::task::spawn_blocking(move || {
        for result in requests {
            match result {
                Ok(req) => {
                    if req_sender.blocking_send(req).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("{e}");
                }
            }
        }
    });

    engine.run(ReceiverStream::new(req_receiver)).await;
    if let Err(e) = reader.await {
        error!("request reader failed: {e}");
        return ExitCode::FAILURE;
    }

    let accounts = match engine.accounts() {
        Ok(accounts) => accounts,
        Err(e) => {
            error!("failed to read accounts: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = write_accounts(io::stdout().lock(), accounts) {
        error!("failed to write accounts: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
