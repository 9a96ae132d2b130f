use serde::{Deserialize, Serialize};
use sj_rbf::{RbfConfig, RbfError, ReadCacheConfig};

use crate::error::{JournalError, Result};

/// Configuration for a [`Journal`](crate::journal::Journal).
///
/// Every field has a default, so a TOML document only needs the keys it
/// wants to change:
///
/// ```toml
/// data_file_name = "objects.rbf"
///
/// [rbf]
/// sync_mode = "every_write"
///
/// [cache]
/// page_size = 8192
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    /// Data file name, relative to the journal directory.
    pub data_file_name: String,
    /// Meta file name, relative to the journal directory.
    pub meta_file_name: String,
    /// Cut both files back to the recovered commit point on open.
    pub truncate_on_recover: bool,
    /// Durability settings shared by both files.
    pub rbf: RbfConfig,
    /// Read cache geometry used for scans and loads.
    pub cache: ReadCacheConfig,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            data_file_name: "data.rbf".to_string(),
            meta_file_name: "meta.rbf".to_string(),
            truncate_on_recover: true,
            rbf: RbfConfig::default(),
            cache: ReadCacheConfig::default(),
        }
    }
}

impl JournalConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| JournalError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| JournalError::InvalidConfig(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        for (key, name) in [
            ("data_file_name", &self.data_file_name),
            ("meta_file_name", &self.meta_file_name),
        ] {
            if name.is_empty() {
                return Err(JournalError::InvalidConfig(format!("{key} is empty")));
            }
        }
        if self.data_file_name == self.meta_file_name {
            return Err(JournalError::InvalidConfig(format!(
                "data and meta files share the name {:?}",
                self.data_file_name
            )));
        }
        self.cache.validate().map_err(|e| match e {
            RbfError::InvalidConfig(msg) => JournalError::InvalidConfig(msg),
            other => JournalError::Rbf(other),
        })
    }
}
