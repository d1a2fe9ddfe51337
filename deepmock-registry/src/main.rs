//! Startup Wiring (C11): load configuration, initialize logging, construct
//! the repository and registry, spawn the reconciliation loop, and serve the
//! admin + mock-traffic HTTP surface until the process exits.
//!
//! Grounded on `pingora-waf/src/main.rs`'s boot sequence — read a config path
//! from the command line (falling back to a default), load it, initialize
//! logging, build every long-lived component up front, and hand listeners to
//! the runtime — adapted from that teacher's `Server`/`background_service`
//! wiring to this crate's `Arc`-wrapped component graph.

use std::path::PathBuf;
use std::sync::Arc;

use log::{info, warn};

use deepmock_registry::admin::AdminHandler;
use deepmock_registry::config::AppConfig;
use deepmock_registry::dispatcher::Dispatcher;
use deepmock_registry::reconcile::ReconcileLoop;
use deepmock_registry::registry::ExecutorRegistry;
use deepmock_registry::repository::{InMemoryRuleRepository, RuleRepository, SqliteRuleRepository};
use deepmock_registry::server::HttpServer;

const DEFAULT_CONFIG_PATH: &str = "deepmock.yaml";

fn config_path() -> PathBuf {
    std::env::args().nth(1).map(PathBuf::from).unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let path = config_path();
    let config = if path.exists() {
        AppConfig::load(&path)?
    } else {
        warn!("config file {} not found, starting with defaults", path.display());
        AppConfig::default()
    };

    let dev_mode = std::env::var("DEEPMOCK_DEV").is_ok();
    let repository: Arc<dyn RuleRepository> = if dev_mode {
        info!("DEEPMOCK_DEV set, using an in-memory rule repository");
        Arc::new(InMemoryRuleRepository::new())
    } else {
        Arc::new(open_sqlite_with_retry(&config)?)
    };

    let registry = Arc::new(ExecutorRegistry::new());

    let reconciler = Arc::new(ReconcileLoop::with_period(
        Arc::clone(&repository),
        Arc::clone(&registry),
        config.reconcile_period(),
    ));
    tokio::spawn(reconciler.start());

    if let Some((cert, key)) = config.tls_files() {
        warn!(
            "server.cert_file ({}) and server.key_file ({}) are configured, but this build \
             serves plain HTTP only; TLS termination must be handled by a reverse proxy in \
             front of it",
            cert.display(),
            key.display()
        );
    }

    let admin = Arc::new(AdminHandler::new(Arc::clone(&repository)));
    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&registry)));
    let server = Arc::new(HttpServer::new(admin, dispatcher));

    server.serve(&config.listen_addr()).await?;
    Ok(())
}

fn open_sqlite_with_retry(config: &AppConfig) -> anyhow::Result<SqliteRuleRepository> {
    let path = config.sqlite_path();
    let retries = config.connect_retry();
    let mut attempt = 0;
    loop {
        match SqliteRuleRepository::open(&path) {
            Ok(repo) => return Ok(repo),
            Err(e) if attempt < retries => {
                attempt += 1;
                warn!(
                    "failed to open rule store at {} (attempt {attempt}/{retries}): {e}",
                    path.display()
                );
            }
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "failed to open rule store at {} after {retries} retries: {e}",
                    path.display()
                ))
            }
        }
    }
}
