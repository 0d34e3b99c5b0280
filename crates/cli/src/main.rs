use clap::{Parser, Subcommand};
use companion::config;
use companion::gateway::ConnectionState;
use companion::session::{CompanionSession, SessionOptions};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "companion")]
#[command(about = "Companion CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Connect to the gateway, show the address and the handshake result.
    Status {
        /// Config file path (default: COMPANION_CONFIG_PATH or ~/.companion/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Seconds to wait for the handshake.
        #[arg(long, default_value_t = 10)]
        wait: u64,
    },

    /// Call one gateway method and print its payload as JSON.
    Call {
        /// Config file path (default: COMPANION_CONFIG_PATH or ~/.companion/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Method name (e.g. "health", "status").
        method: String,

        /// JSON params object.
        #[arg(long, value_name = "JSON", default_value = "{}")]
        params: String,

        /// Seconds to wait for the handshake.
        #[arg(long, default_value_t = 10)]
        wait: u64,
    },

    /// Print gateway events and connectivity changes until Ctrl-C.
    Watch {
        /// Config file path (default: COMPANION_CONFIG_PATH or ~/.companion/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Only print events with this name.
        #[arg(long, value_name = "NAME")]
        event: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("companion {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Status { config, wait }) => {
            if let Err(e) = run_status(config, wait).await {
                log::error!("status failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Call {
            config,
            method,
            params,
            wait,
        }) => {
            if let Err(e) = run_call(config, method, params, wait).await {
                log::error!("call failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Watch { config, event }) => {
            if let Err(e) = run_watch(config, event).await {
                log::error!("watch failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn start_session(
    config_path: Option<std::path::PathBuf>,
    options: SessionOptions,
) -> anyhow::Result<CompanionSession> {
    let (config, path) = config::load_config(config_path)?;
    log::debug!("using config {}", path.display());
    CompanionSession::start(&config, options)
}

async fn run_status(config_path: Option<std::path::PathBuf>, wait: u64) -> anyhow::Result<()> {
    let session = start_session(config_path, SessionOptions::default())?;
    let conn = session.connection();
    println!("gateway: {}", conn.options().url);
    let result = conn.wait_ready(Duration::from_secs(wait)).await;
    match (&result, conn.hello()) {
        (Ok(()), Some(hello)) => {
            println!("state: ready");
            println!("{}", serde_json::to_string_pretty(&hello)?);
        }
        (Ok(()), None) => println!("state: ready"),
        (Err(e), _) => println!("state: {:?} ({})", conn.state(), e),
    }
    session.shutdown().await;
    result.map_err(anyhow::Error::from)
}

async fn run_call(
    config_path: Option<std::path::PathBuf>,
    method: String,
    params: String,
    wait: u64,
) -> anyhow::Result<()> {
    let params: serde_json::Value = serde_json::from_str(&params)
        .map_err(|e| anyhow::anyhow!("--params is not valid JSON: {}", e))?;
    let session = start_session(config_path, SessionOptions::default())?;
    let conn = session.connection();
    let result = match conn.wait_ready(Duration::from_secs(wait)).await {
        Ok(()) => conn.request(&method, params).await,
        Err(e) => Err(e),
    };
    session.shutdown().await;
    let payload = result?;
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

async fn run_watch(config_path: Option<std::path::PathBuf>, event: Option<String>) -> anyhow::Result<()> {
    let options = SessionOptions {
        on_status: Some(Box::new(|connected: bool| {
            if connected {
                eprintln!("-- connected");
            } else {
                eprintln!("-- disconnected");
            }
        })),
        on_event: Some(Box::new(move |name: &str, payload: &serde_json::Value| {
            if event.as_deref().map_or(true, |e| e == name) {
                println!("{} {}", name, payload);
            }
        })),
        ..Default::default()
    };
    let session = start_session(config_path, options)?;
    let mut states = session.connection().state_changes();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                if *states.borrow_and_update() == ConnectionState::Degraded {
                    log::warn!("gateway rejected the handshake; events may be withheld");
                }
            }
        }
    }
    session.shutdown().await;
    Ok(())
}
