//! Configuration for garlicd

use anyhow::Context;
use clap::Parser;
use garlic_session::SessionConfig;
use std::path::{Path, PathBuf};

/// garlicd - Garlic session daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "garlicd")]
#[command(about = "Garlic session daemon over an in-process tunnel network")]
pub struct Config {
    /// Data directory for persisted identity keys
    #[arg(short, long, default_value = "./data/garlicd", env = "GARLICD_DATA_DIR")]
    pub data_dir: PathBuf,

    /// Number of local identities to run
    #[arg(long, default_value = "2")]
    pub identities: usize,

    /// Session tuning file (JSON); missing fields take defaults
    #[arg(long)]
    pub session_config: Option<PathBuf>,

    /// Override the resend interval in seconds
    #[arg(long)]
    pub resend_interval_secs: Option<u64>,

    /// Exchange demo traffic between the local identities
    #[arg(long)]
    pub demo: bool,

    /// Seconds between demo messages
    #[arg(long, default_value = "5")]
    pub demo_interval_secs: u64,

    /// Request an explicit acknowledgment for every demo message
    #[arg(long)]
    pub explicit_ack: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.identities == 0 {
            anyhow::bail!("At least one identity is required");
        }
        if self.demo && self.identities < 2 {
            anyhow::bail!("Demo traffic needs at least 2 identities");
        }
        if self.demo_interval_secs == 0 {
            anyhow::bail!("Demo interval must be greater than zero");
        }
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            anyhow::bail!("Unknown log format: {}", self.log_format);
        }
        Ok(())
    }

    pub fn json_logs(&self) -> bool {
        self.log_format == "json"
    }

    /// Session configuration: file (if any), then command-line overrides
    pub fn session_config(&self) -> anyhow::Result<SessionConfig> {
        let mut config = match &self.session_config {
            Some(path) => load_session_config(path)?,
            None => SessionConfig::default(),
        };
        if let Some(secs) = self.resend_interval_secs {
            config.resend_interval_secs = secs;
        }
        config.validate().context("Invalid session configuration")?;
        Ok(config)
    }

    /// Key file for the `index`-th local identity
    pub fn key_path(&self, index: usize) -> PathBuf {
        self.data_dir.join(format!("identity-{index}.keys"))
    }
}

/// Read a JSON session configuration file
pub fn load_session_config(path: &Path) -> anyhow::Result<SessionConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Reading session config {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Parsing session config {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{tempdir, NamedTempFile};

    fn test_config() -> Config {
        Config {
            data_dir: tempdir().unwrap().into_path(),
            identities: 2,
            session_config: None,
            resend_interval_secs: None,
            demo: false,
            demo_interval_secs: 5,
            explicit_ack: false,
            log_format: "pretty".to_string(),
        }
    }

    #[test]
    fn test_defaults_validate() {
        let config = test_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.session_config().unwrap(), SessionConfig::default());
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = test_config();
        config.log_format = "xml".to_string();
        assert!(config.validate().is_err());

        let mut config = test_config();
        config.demo = true;
        config.identities = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_session_config_file_and_override() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{ "refill_batch": 20, "resend_interval_secs": 30 }}"#).unwrap();

        let mut config = test_config();
        config.session_config = Some(file.path().to_path_buf());
        let session = config.session_config().unwrap();
        assert_eq!(session.refill_batch, 20);
        assert_eq!(session.resend_interval_secs, 30);

        config.resend_interval_secs = Some(10);
        assert_eq!(config.session_config().unwrap().resend_interval_secs, 10);
    }

    #[test]
    fn test_invalid_session_config_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{ "refill_batch": 0 }}"#).unwrap();

        let mut config = test_config();
        config.session_config = Some(file.path().to_path_buf());
        assert!(config.session_config().is_err());
    }

    #[test]
    fn test_key_paths_distinct() {
        let config = test_config();
        assert_ne!(config.key_path(0), config.key_path(1));
        assert!(config.key_path(0).starts_with(&config.data_dir));
    }
}
