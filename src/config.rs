use std::env;
use std::fmt;
use std::path::PathBuf;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::{Result, TransferError};
use crate::models::Platform;

pub const DEFAULT_CHUNK_SIZE: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub registry: RegistryConfig,
    /// Platform to select from multi-platform indexes, `os/arch[/variant]`
    pub platform: Option<String>,
}

#[derive(Clone, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub fs_root: Option<PathBuf>,
    pub s3_bucket: Option<String>,
    pub s3_region: Option<String>,
    pub s3_endpoint: Option<String>,
    pub s3_access_key: Option<String>,
    pub s3_secret_key: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Fs,
    S3,
    Memory,
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageBackend::Fs => write!(f, "fs"),
            StorageBackend::S3 => write!(f, "s3"),
            StorageBackend::Memory => write!(f, "memory"),
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct RegistryConfig {
    /// Registry hosts spoken to over plain HTTP
    #[serde(default)]
    pub plain_http: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Upload chunk size in bytes
    pub chunk_size: usize,
}

impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageConfig")
            .field("backend", &self.backend)
            .field("fs_root", &self.fs_root)
            .field("s3_bucket", &self.s3_bucket)
            .field("s3_region", &self.s3_region)
            .field("s3_endpoint", &self.s3_endpoint)
            .field("s3_access_key", &self.s3_access_key)
            .field(
                "s3_secret_key",
                &self.s3_secret_key.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

impl fmt::Debug for RegistryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryConfig")
            .field("plain_http", &self.plain_http)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "dev".into());

        let config = Config::builder()
            // Start with default values
            .set_default("storage.backend", "fs")?
            .set_default("storage.fs_root", "./data")?
            .set_default("registry.chunk_size", DEFAULT_CHUNK_SIZE as u64)?
            // Add configuration from files
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Add environment variables, e.g. IMGFERRY_STORAGE__FS_ROOT
            .add_source(
                Environment::with_prefix("IMGFERRY")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("registry.plain_http")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| TransferError::Config(e.to_string()))?;

        config
            .try_deserialize()
            .map_err(|e| TransferError::Config(e.to_string()))
    }

    /// The configured platform, or the host's.
    pub fn platform(&self) -> Result<Platform> {
        match &self.platform {
            Some(platform) => platform.parse().map_err(TransferError::Config),
            None => Ok(Platform::host()),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig {
                backend: StorageBackend::Fs,
                fs_root: Some(PathBuf::from("./data")),
                s3_bucket: None,
                s3_region: None,
                s3_endpoint: None,
                s3_access_key: None,
                s3_secret_key: None,
            },
            registry: RegistryConfig::default(),
            platform: None,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            plain_http: Vec::new(),
            username: None,
            password: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}
