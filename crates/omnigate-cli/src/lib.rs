//! # omnigate-cli
//!
//! Command-line surface of the gateway: `serve` runs a replica, `reload`
//! pokes running replicas through the configured notifier.
//!
//! Exit codes: 0 ok, 1 config error, 2 I/O error, 3 validation error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info};

use omnigate_config::{
    ConfigEvent, DiskStore, FileNotifier, Notifier, RedisNotifier, SignalNotifier, ENV_CONFIG_DIR,
};
use omnigate_server::{GatewayConfig, GatewayError, GatewayState};

/// Exit code for configuration problems.
pub const EXIT_CONFIG: u8 = 1;
/// Exit code for I/O problems.
pub const EXIT_IO: u8 = 2;
/// Exit code for validation failures.
pub const EXIT_VALIDATION: u8 = 3;

/// omnigate: a multi-tenant MCP gateway.
#[derive(Debug, Parser)]
#[command(name = "omnigate", version, about)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Config store root (one YAML per config)
    #[arg(long, env = ENV_CONFIG_DIR, default_value = "./configs", global = true)]
    config_dir: PathBuf,

    /// Notifier wiring between control plane and replicas
    #[arg(long, value_enum, default_value_t = NotifierKind::Signal, global = true)]
    notifier: NotifierKind,

    /// Event file for the file notifier
    #[arg(long, default_value = "./configs/.events.json", global = true)]
    event_file: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum NotifierKind {
    /// SIGHUP + pid file
    Signal,
    /// Watched JSON event file
    File,
    /// Redis pub/sub (`REDIS_URL`)
    Redis,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a gateway replica
    Serve {
        /// Listen address
        #[arg(long, default_value = "0.0.0.0:5235")]
        addr: String,
    },
    /// Trigger a reload on running replicas
    Reload,
}

/// Concrete notifier selection; the receive hookup differs per variant,
/// so the choice stays visible instead of hiding behind the trait.
enum BuiltNotifier {
    Signal(Arc<SignalNotifier>),
    File(Arc<FileNotifier>),
    Redis(Arc<RedisNotifier>),
}

impl BuiltNotifier {
    fn as_dyn(&self) -> Arc<dyn Notifier> {
        match self {
            Self::Signal(n) => Arc::clone(n) as Arc<dyn Notifier>,
            Self::File(n) => Arc::clone(n) as Arc<dyn Notifier>,
            Self::Redis(n) => Arc::clone(n) as Arc<dyn Notifier>,
        }
    }

    async fn start_receiving(&self) -> Result<(), ExitCode> {
        let result = match self {
            Self::Signal(signal) => {
                signal.write_pid_file().await.ok();
                signal.start_receiving().map_err(|e| e.to_string())
            }
            Self::File(file) => file.start_receiving().map_err(|e| e.to_string()),
            Self::Redis(redis) => {
                redis.start_receiving();
                Ok(())
            }
        };
        result.map_err(|e| {
            error!(error = %e, "notifier receive setup failed");
            ExitCode::from(EXIT_IO)
        })
    }
}

impl Cli {
    /// Execute the parsed command.
    pub async fn run(self) -> ExitCode {
        match &self.command {
            Command::Serve { addr } => self.serve(addr.clone()).await,
            Command::Reload => self.reload().await,
        }
    }

    fn build_notifier(&self) -> Result<BuiltNotifier, ExitCode> {
        match self.notifier {
            NotifierKind::Signal => Ok(BuiltNotifier::Signal(Arc::new(SignalNotifier::from_env()))),
            NotifierKind::File => Ok(BuiltNotifier::File(Arc::new(FileNotifier::new(
                &self.event_file,
            )))),
            NotifierKind::Redis => match RedisNotifier::from_env() {
                Ok(notifier) => Ok(BuiltNotifier::Redis(Arc::new(notifier))),
                Err(e) => {
                    error!(error = %e, "redis notifier unavailable");
                    Err(ExitCode::from(EXIT_CONFIG))
                }
            },
        }
    }

    async fn serve(&self, addr: String) -> ExitCode {
        let store = match DiskStore::open(&self.config_dir).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                error!(error = %e, dir = %self.config_dir.display(), "cannot open config store");
                return ExitCode::from(EXIT_IO);
            }
        };

        let state = GatewayState::new(store, GatewayConfig::default());
        match state.reload().await {
            Ok(generation) => info!(generation, "initial config loaded"),
            Err(GatewayError::Validation(errors)) => {
                for err in &errors {
                    error!(%err, "config validation failed");
                }
                return ExitCode::from(EXIT_VALIDATION);
            }
            Err(e) => {
                error!(error = %e, "initial load failed");
                return ExitCode::from(EXIT_CONFIG);
            }
        }

        let notifier = match self.build_notifier() {
            Ok(notifier) => notifier,
            Err(code) => return code,
        };
        if let Err(code) = notifier.start_receiving().await {
            return code;
        }
        state.watch_notifier(notifier.as_dyn());
        state.start_background();

        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(error = %e, %addr, "cannot bind");
                return ExitCode::from(EXIT_IO);
            }
        };

        let shutdown = async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        };
        match omnigate_server::serve(state, listener, shutdown).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!(error = %e, "server error");
                ExitCode::from(EXIT_IO)
            }
        }
    }

    async fn reload(&self) -> ExitCode {
        let notifier = match self.build_notifier() {
            Ok(notifier) => notifier,
            Err(code) => return code,
        };
        match notifier.as_dyn().notify(ConfigEvent::reload_all()).await {
            Ok(()) => {
                info!("reload event published");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!(error = %e, "reload notification failed");
                ExitCode::from(EXIT_IO)
            }
        }
    }
}

/// Install the tracing subscriber from `RUST_LOG`.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
