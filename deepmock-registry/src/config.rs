//! Startup configuration (C11): `{ server.port, server.cert_file, server.key_file
//! (TLS when both present), db.{host,port,username,password,name,connect_retry},
//! reconcile.period }`. Loaded once at startup from YAML; no live reload.
//!
//! Grounded on `pingora-waf/src/config.rs`'s `AppConfig`/`TlsConfig` shape:
//! optional fields with `unwrap_or`-defaulted accessor methods, deserialized
//! once via `serde_yaml` at process start.

use std::path::PathBuf;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServerConfig {
    pub port: Option<u16>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DbConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub name: Option<String>,
    pub connect_retry: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ReconcileConfig {
    pub period: Option<u64>,
}

impl AppConfig {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;
        let config: AppConfig = serde_yaml::from_str(&text)
            .map_err(|e| anyhow::anyhow!("failed to parse config file {}: {e}", path.display()))?;
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("0.0.0.0:{}", self.server.port.unwrap_or(8080))
    }

    /// TLS is enabled only when both the cert and key file are configured.
    pub fn tls_files(&self) -> Option<(&PathBuf, &PathBuf)> {
        match (&self.server.cert_file, &self.server.key_file) {
            (Some(cert), Some(key)) => Some((cert, key)),
            _ => None,
        }
    }

    pub fn reconcile_period(&self) -> std::time::Duration {
        std::time::Duration::from_secs(
            self.reconcile
                .period
                .unwrap_or(crate::reconcile::DEFAULT_RECONCILE_PERIOD.as_secs()),
        )
    }

    /// SQLite file path derived from `db.name`, defaulting to an on-disk file
    /// in the current directory when unset. DeepMock's persisted rule store
    /// is SQLite (DESIGN.md), so `db.host`/`port`/`username`/`password` are
    /// accepted for configuration-schema compatibility but unused by the
    /// repository implementation this crate ships.
    pub fn sqlite_path(&self) -> PathBuf {
        PathBuf::from(self.db.name.clone().unwrap_or_else(|| "deepmock.db".to_string()))
    }

    pub fn connect_retry(&self) -> u32 {
        self.db.connect_retry.unwrap_or(3)
    }
}
