use std::{collections::BTreeMap, path::Path, path::PathBuf, str::FromStr};

use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),

    #[error("default disk `{0}` is not configured")]
    MissingDefault(String),

    #[error("disk `{disk}`: {message}")]
    Invalid { disk: String, message: String },
}

/// Named disks plus the one used when none is asked for.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct StorageConfig {
    pub default: String,
    #[serde(default)]
    pub disks: BTreeMap<String, DiskConfig>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "driver", rename_all = "lowercase")]
pub enum DiskConfig {
    Local(LocalConfig),
    S3(S3Config),
    Gcs(GcsConfig),
    Azure(AzureConfig),
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct LocalConfig {
    pub root: PathBuf,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct S3Config {
    pub bucket: String,
    /// Falls back to the AWS environment chain when unset.
    #[serde(default)]
    pub region: Option<String>,
    /// S3 compatible endpoint (minio, localstack, ...).
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub force_path_style: bool,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct GcsConfig {
    pub bucket: String,
    /// Service account key file; ambient credentials when unset.
    #[serde(default)]
    pub key_filename: Option<PathBuf>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct AzureConfig {
    pub container: String,
    pub connection_string: String,
}

impl DiskConfig {
    pub fn driver(&self) -> &'static str {
        match self {
            Self::Local(_) => "local",
            Self::S3(_) => "s3",
            Self::Gcs(_) => "gcs",
            Self::Azure(_) => "azure",
        }
    }

    fn validate(&self, disk: &str) -> Result<(), ConfigError> {
        let missing = match self {
            Self::Local(c) if c.root.as_os_str().is_empty() => Some("root"),
            Self::S3(c) if c.bucket.is_empty() => Some("bucket"),
            Self::Gcs(c) if c.bucket.is_empty() => Some("bucket"),
            Self::Azure(c) if c.container.is_empty() => Some("container"),
            Self::Azure(c) if c.connection_string.is_empty() => Some("connection_string"),
            _ => None,
        };

        match missing {
            Some(field) => Err(ConfigError::Invalid {
                disk: disk.to_string(),
                message: format!("`{}` must not be empty", field),
            }),
            None => Ok(()),
        }
    }
}

impl StorageConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        raw.parse()
    }

    /// The default disk must exist and every disk must name its root.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.disks.contains_key(&self.default) {
            return Err(ConfigError::MissingDefault(self.default.clone()));
        }

        for (name, disk) in &self.disks {
            disk.validate(name)?;
        }

        Ok(())
    }
}

impl FromStr for StorageConfig {
    type Err = ConfigError;

    /// Parses and validates.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: StorageConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}
