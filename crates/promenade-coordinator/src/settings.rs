//! Environment-based coordinator configuration.
//!
//! - `PORT`: listen port (default 6363)
//! - `DOMAIN`: public hostname (default "localhost")
//! - `SECRET_KEY`: required hex32, the coordinator's relay identity
//! - `DB_PATH`: registration store directory (default
//!   `/tmp/promenade-store`)

use std::env;
use std::path::PathBuf;

use thiserror::Error;

use promenade_common::Keys;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(&'static str),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub domain: String,
    pub secret_key: Keys,
    pub db_path: PathBuf,
}

impl Settings {
    pub fn from_env() -> Result<Self, SettingsError> {
        let port = match env::var("PORT") {
            Ok(raw) => raw
                .parse()
                .map_err(|_| SettingsError::InvalidValue("PORT", raw))?,
            Err(_) => 6363,
        };
        let domain = env::var("DOMAIN").unwrap_or_else(|_| "localhost".to_string());

        let secret_hex =
            env::var("SECRET_KEY").map_err(|_| SettingsError::MissingEnvVar("SECRET_KEY"))?;
        let secret_key = Keys::parse(&secret_hex)
            .map_err(|e| SettingsError::InvalidValue("SECRET_KEY", e.to_string()))?;

        let db_path = env::var("DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp/promenade-store"));

        Ok(Settings {
            port,
            domain,
            secret_key,
            db_path,
        })
    }

    /// The relay URL this coordinator advertises to signers and clients.
    pub fn url(&self) -> String {
        if self.domain == "localhost" || self.domain.parse::<std::net::IpAddr>().is_ok() {
            format!("ws://{}:{}", self.domain, self.port)
        } else {
            format!("wss://{}", self.domain)
        }
    }
}
