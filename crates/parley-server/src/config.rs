use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, bail};

use parley_sync::SyncConfig;

/// Secrets that must never reach production.
const PLACEHOLDER_SECRETS: &[&str] = &["", "changeme", "change-me", "dev-secret-change-me", "secret"];

pub struct ServerConfig {
    pub db_path: PathBuf,
    pub addr: SocketAddr,
    pub jwt_secret: String,
    pub sync: SyncConfig,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let db_path = std::env::var("PARLEY_DB_PATH").unwrap_or_else(|_| "parley.db".into());
        let host = std::env::var("PARLEY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = std::env::var("PARLEY_PORT")
            .unwrap_or_else(|_| "3000".into())
            .parse()
            .context("PARLEY_PORT must be a port number")?;

        let jwt_secret = std::env::var("PARLEY_JWT_SECRET").context("PARLEY_JWT_SECRET is not set")?;
        check_secret(&jwt_secret)?;

        let addr = format!("{}:{}", host, port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", host, port))?;

        Ok(Self {
            db_path: PathBuf::from(db_path),
            addr,
            jwt_secret,
            sync: SyncConfig::from_env(),
        })
    }
}

fn check_secret(secret: &str) -> anyhow::Result<()> {
    if PLACEHOLDER_SECRETS.contains(&secret.trim().to_ascii_lowercase().as_str()) {
        bail!("PARLEY_JWT_SECRET is a placeholder; set a real secret");
    }
    Ok(())
}
