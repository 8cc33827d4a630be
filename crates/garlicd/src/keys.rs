//! Persisted identity keys

use garlic_core::{ElGamalKeyPair, IdentHash};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::info;

/// Key store errors
#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),
    #[error("Key file {0} does not match its identity hash")]
    Corrupt(String),
}

/// Long-term keys of one local identity
#[derive(Clone, Serialize, Deserialize)]
pub struct NodeKeys {
    /// Identity hash: SHA-256 of the public encryption key
    pub identity: IdentHash,
    /// ElGamal encryption keys
    pub encryption: ElGamalKeyPair,
}

impl NodeKeys {
    /// Fresh keys
    pub fn generate() -> Self {
        let encryption = ElGamalKeyPair::generate();
        Self {
            identity: IdentHash::of(&encryption.public.0),
            encryption,
        }
    }

    /// Load keys from `path`, generating and saving them when absent
    pub fn load_or_generate(path: &Path) -> Result<Self, KeyStoreError> {
        if path.exists() {
            let keys = Self::load(path)?;
            info!("Loaded identity {} from {}", keys.identity, path.display());
            return Ok(keys);
        }
        let keys = Self::generate();
        keys.save(path)?;
        info!("Generated identity {} at {}", keys.identity, path.display());
        Ok(keys)
    }

    pub fn load(path: &Path) -> Result<Self, KeyStoreError> {
        let bytes = fs::read(path)?;
        let keys: Self = postcard::from_bytes(&bytes)?;
        if IdentHash::of(&keys.encryption.public.0) != keys.identity {
            return Err(KeyStoreError::Corrupt(path.display().to_string()));
        }
        Ok(keys)
    }

    pub fn save(&self, path: &Path) -> Result<(), KeyStoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = postcard::to_allocvec(self)?;
        fs::write(path, bytes)?;
        Ok(())
    }
}
