//! Configuration file management for sluice.
//!
//! Provides a TOML-based config file at `~/.config/sluice/config.toml` and
//! a resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use sluice_core::token::TokenConfig;
use sluice_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    pub auth: AuthSection,
    pub storage: StorageSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthSection {
    /// Hex-encoded token secret (64 hex chars = 32 bytes).
    pub token_secret: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StorageSection {
    /// Local filesystem root for the blob store.
    pub root: String,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the sluice config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/sluice` or `~/.config/sluice`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("sluice");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("sluice")
}

/// Return the path to the sluice config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Token secret generation
// -----------------------------------------------------------------------

/// Generate a random token secret: 32 random bytes, hex-encoded (64 chars).
pub fn generate_token_secret() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct SluiceConfig {
    pub db_config: DbConfig,
    pub token_config: TokenConfig,
    pub storage_root: PathBuf,
}

impl SluiceConfig {
    /// Resolve configuration using the chain:
    /// CLI flag > env var > config file > default.
    pub fn resolve(database_url_flag: Option<&str>) -> Result<Self> {
        let file = load_config().ok();

        let database_url = database_url_flag
            .map(str::to_owned)
            .or_else(|| std::env::var("SLUICE_DATABASE_URL").ok())
            .or_else(|| file.as_ref().map(|f| f.database.url.clone()))
            .unwrap_or_else(|| DbConfig::DEFAULT_URL.to_owned());

        let token_secret_hex = std::env::var("SLUICE_TOKEN_SECRET")
            .ok()
            .or_else(|| file.as_ref().map(|f| f.auth.token_secret.clone()))
            .context(
                "no token secret configured: run `sluice init` or set SLUICE_TOKEN_SECRET",
            )?;
        let secret = hex::decode(&token_secret_hex)
            .context("token secret is not valid hex")?;

        let storage_root = std::env::var("SLUICE_STORAGE_ROOT")
            .ok()
            .or_else(|| file.as_ref().map(|f| f.storage.root.clone()))
            .map(PathBuf::from)
            .unwrap_or_else(|| config_dir().join("blobs"));

        Ok(Self {
            db_config: DbConfig::new(database_url),
            token_config: TokenConfig::new(secret),
            storage_root,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_token_secret_is_random() {
        let a = generate_token_secret();
        let b = generate_token_secret();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
        assert!(hex::decode(&a).is_ok());
    }

    #[test]
    fn config_file_roundtrip() {
        let config = ConfigFile {
            database: DatabaseSection {
                url: "postgresql://localhost:5432/sluice".to_owned(),
            },
            auth: AuthSection {
                token_secret: generate_token_secret(),
            },
            storage: StorageSection {
                root: "/var/lib/sluice/blobs".to_owned(),
            },
        };
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let back: ConfigFile = toml::from_str(&toml_str).unwrap();
        assert_eq!(back.database.url, config.database.url);
        assert_eq!(back.auth.token_secret, config.auth.token_secret);
        assert_eq!(back.storage.root, config.storage.root);
    }
}
