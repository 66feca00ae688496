//! Server configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorCode, Result};
use crate::{DEFAULT_IO_TIMEOUT_MS, DEFAULT_PORT, DEFAULT_REKEY_INTERVAL_MS};

/// Runtime server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address
    pub listen_addr: String,
    /// Listen port
    pub listen_port: u16,
    /// Directory all remote paths resolve under
    pub share_root: PathBuf,
    /// Confine remote paths to the share root (default on)
    pub sandbox: bool,
    /// Allow uploads to replace existing files
    pub allow_overwrite: bool,
    /// Demand a pre-shared key from clients
    pub require_psk: bool,
    /// The pre-shared key, when required
    pub psk: Option<String>,
    /// Demand an allowlisted client identity
    pub require_client_auth: bool,
    /// Passphrase protecting the server secret key
    pub passphrase: Option<String>,
    /// Override the config directory holding keys and trust material
    pub config_dir: Option<PathBuf>,
    /// Receive deadline (milliseconds)
    pub io_timeout_ms: u64,
    /// Rekey interval (milliseconds)
    pub rekey_interval_ms: u64,
}

impl ServerConfig {
    /// A configuration with defaults for everything but the share root.
    pub fn new(share_root: impl Into<PathBuf>) -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            listen_port: DEFAULT_PORT,
            share_root: share_root.into(),
            sandbox: true,
            allow_overwrite: false,
            require_psk: false,
            psk: None,
            require_client_auth: false,
            passphrase: None,
            config_dir: None,
            io_timeout_ms: DEFAULT_IO_TIMEOUT_MS,
            rekey_interval_ms: DEFAULT_REKEY_INTERVAL_MS,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.is_empty() {
            return Err(Error::local(ErrorCode::Config, "listen_addr cannot be empty"));
        }
        if self.share_root.as_os_str().is_empty() {
            return Err(Error::local(ErrorCode::Config, "share_root cannot be empty"));
        }
        if self.require_psk && self.psk.is_none() {
            return Err(Error::local(
                ErrorCode::Config,
                "require_psk is set but no psk is configured",
            ));
        }
        if self.io_timeout_ms == 0 {
            return Err(Error::local(ErrorCode::Config, "io_timeout_ms must be positive"));
        }
        Ok(())
    }
}

/// Configuration file format for serialization.
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfigFile {
    pub listen_addr: Option<String>,
    pub listen_port: Option<u16>,
    pub share_root: String,
    pub sandbox: Option<bool>,
    pub allow_overwrite: Option<bool>,
    pub require_psk: Option<bool>,
    pub psk: Option<String>,
    pub require_client_auth: Option<bool>,
    pub passphrase: Option<String>,
    pub config_dir: Option<String>,
    pub io_timeout_ms: Option<u64>,
    pub rekey_interval_ms: Option<u64>,
}

impl ServerConfigFile {
    /// Convert to runtime configuration.
    pub fn to_config(&self) -> ServerConfig {
        let defaults = ServerConfig::new(&self.share_root);
        ServerConfig {
            listen_addr: self.listen_addr.clone().unwrap_or(defaults.listen_addr),
            listen_port: self.listen_port.unwrap_or(defaults.listen_port),
            share_root: PathBuf::from(&self.share_root),
            sandbox: self.sandbox.unwrap_or(defaults.sandbox),
            allow_overwrite: self.allow_overwrite.unwrap_or(defaults.allow_overwrite),
            require_psk: self.require_psk.unwrap_or(defaults.require_psk),
            psk: self.psk.clone(),
            require_client_auth: self
                .require_client_auth
                .unwrap_or(defaults.require_client_auth),
            passphrase: self.passphrase.clone(),
            config_dir: self.config_dir.clone().map(PathBuf::from),
            io_timeout_ms: self.io_timeout_ms.unwrap_or(defaults.io_timeout_ms),
            rekey_interval_ms: self.rekey_interval_ms.unwrap_or(defaults.rekey_interval_ms),
        }
    }

    /// Create from runtime configuration.
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            listen_addr: Some(config.listen_addr.clone()),
            listen_port: Some(config.listen_port),
            share_root: config.share_root.display().to_string(),
            sandbox: Some(config.sandbox),
            allow_overwrite: Some(config.allow_overwrite),
            require_psk: Some(config.require_psk),
            psk: config.psk.clone(),
            require_client_auth: Some(config.require_client_auth),
            passphrase: config.passphrase.clone(),
            config_dir: config
                .config_dir
                .as_ref()
                .map(|p| p.display().to_string()),
            io_timeout_ms: Some(config.io_timeout_ms),
            rekey_interval_ms: Some(config.rekey_interval_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::new("/srv/share");
        assert_eq!(config.listen_port, DEFAULT_PORT);
        assert!(config.sandbox);
        assert!(!config.allow_overwrite);
        config.validate().unwrap();
    }

    #[test]
    fn test_psk_validation() {
        let mut config = ServerConfig::new("/srv/share");
        config.require_psk = true;
        assert_eq!(config.validate().unwrap_err().code(), ErrorCode::Config);

        config.psk = Some("sesame".to_string());
        config.validate().unwrap();
    }

    #[test]
    fn test_config_file_round_trip() {
        let mut config = ServerConfig::new("/srv/share");
        config.listen_port = 7777;
        config.passphrase = Some("pw".to_string());

        let file = ServerConfigFile::from_config(&config);
        let text = toml::to_string_pretty(&file).unwrap();
        let parsed: ServerConfigFile = toml::from_str(&text).unwrap();
        let restored = parsed.to_config();

        assert_eq!(restored.listen_port, 7777);
        assert_eq!(restored.share_root, config.share_root);
        assert_eq!(restored.passphrase.as_deref(), Some("pw"));
    }

    #[test]
    fn test_minimal_config_file() {
        let parsed: ServerConfigFile = toml::from_str("share_root = \"/srv/depot\"").unwrap();
        let config = parsed.to_config();
        assert_eq!(config.listen_port, DEFAULT_PORT);
        assert!(config.sandbox);
    }
}
