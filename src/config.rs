//! Runtime configuration read from `IMAGEVAULT_*` environment variables.

use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use tracing::warn;

use crate::error::{ImageVaultError, Result};

pub const ENV_DATA_DIR: &str = "IMAGEVAULT_DATA_DIR";
pub const ENV_PUBLIC_URL: &str = "IMAGEVAULT_PUBLIC_URL";
pub const ENV_SIGNING_KEY: &str = "IMAGEVAULT_SIGNING_KEY";
pub const ENV_PRESIGN_TTL: &str = "IMAGEVAULT_PRESIGN_TTL";
pub const ENV_WORKERS: &str = "IMAGEVAULT_WORKERS";

const DEFAULT_PUBLIC_URL: &str = "http://127.0.0.1:8000/files";
const DEV_SIGNING_KEY: &str = "imagevault-dev-signing-key";
const DEFAULT_PRESIGN_TTL_SECS: u64 = 3600;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Root for `blobs/`, `images.json` and `users.json`.
    pub data_dir: PathBuf,
    pub public_url: String,
    pub signing_key: String,
    pub presign_ttl: Duration,
    /// Upper bound on concurrently running transformations.
    pub workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            public_url: DEFAULT_PUBLIC_URL.to_string(),
            signing_key: DEV_SIGNING_KEY.to_string(),
            presign_ttl: Duration::from_secs(DEFAULT_PRESIGN_TTL_SECS),
            workers: default_workers(),
        }
    }
}

impl Config {
    /// Read the process environment. Call `dotenv::dotenv()` first to pick up
    /// a `.env` file.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a config from any variable source; unset variables take defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let signing_key = match lookup(ENV_SIGNING_KEY).filter(|k| !k.is_empty()) {
            Some(key) => key,
            None => {
                warn!("{} is not set; presigned URLs use an insecure development key", ENV_SIGNING_KEY);
                defaults.signing_key
            }
        };

        let presign_ttl = match lookup(ENV_PRESIGN_TTL) {
            Some(raw) => Duration::from_secs(parse_number(ENV_PRESIGN_TTL, &raw)?),
            None => defaults.presign_ttl,
        };

        let workers = match lookup(ENV_WORKERS) {
            Some(raw) => parse_number::<usize>(ENV_WORKERS, &raw)?,
            None => defaults.workers,
        };
        if workers == 0 {
            return Err(ImageVaultError::Validation(format!(
                "{} must be at least 1",
                ENV_WORKERS
            )));
        }

        Ok(Self {
            data_dir: lookup(ENV_DATA_DIR).map(PathBuf::from).unwrap_or(defaults.data_dir),
            public_url: lookup(ENV_PUBLIC_URL).unwrap_or(defaults.public_url),
            signing_key,
            presign_ttl,
            workers,
        })
    }

    pub fn blob_dir(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }

    pub fn images_path(&self) -> PathBuf {
        self.data_dir.join("images.json")
    }

    pub fn users_path(&self) -> PathBuf {
        self.data_dir.join("users.json")
    }
}

fn default_workers() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(2)
}

fn parse_number<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim().parse().map_err(|_| {
        ImageVaultError::Validation(format!("{} must be a non-negative integer, got {:?}", name, raw))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = Config::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.presign_ttl, Duration::from_secs(3600));
        assert_eq!(config.signing_key, DEV_SIGNING_KEY);
        assert!(config.workers >= 1);
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup_from(&[
            (ENV_DATA_DIR, "/var/lib/imagevault"),
            (ENV_PUBLIC_URL, "https://cdn.example.com/img"),
            (ENV_SIGNING_KEY, "s3cret"),
            (ENV_PRESIGN_TTL, "60"),
            (ENV_WORKERS, "3"),
        ]))
        .unwrap();

        assert_eq!(config.blob_dir(), PathBuf::from("/var/lib/imagevault/blobs"));
        assert_eq!(config.users_path(), PathBuf::from("/var/lib/imagevault/users.json"));
        assert_eq!(config.public_url, "https://cdn.example.com/img");
        assert_eq!(config.signing_key, "s3cret");
        assert_eq!(config.presign_ttl, Duration::from_secs(60));
        assert_eq!(config.workers, 3);
    }

    #[test]
    fn test_invalid_numbers_rejected() {
        for pairs in [[(ENV_PRESIGN_TTL, "soon")], [(ENV_WORKERS, "-2")], [(ENV_WORKERS, "0")]] {
            let result = Config::from_lookup(lookup_from(&pairs));
            assert!(matches!(result, Err(ImageVaultError::Validation(_))));
        }
    }
}
