//! Worker configuration, read from a TOML file.
//!
//! Every section and every key is optional:
//!
//! ```toml
//! [exec]
//! root = "/var/lib/farmhand/exec"
//! link_input_directories = true
//! linked_input_directories = ["external/.*"]
//!
//! [exec.owner]
//! user = "builder"
//! group = "builders"
//!
//! [input_fetch]
//! width = 8
//!
//! [cas_write.retry]
//! max_attempts = 3
//!
//! [backplane]
//! storage_workers = ["10.0.0.2:8981", "10.0.0.3:8981"]
//! ```
use std::{path::Path, path::PathBuf, sync::Arc};

use farmhand_castore::cache::Cache;
use serde::Deserialize;

use crate::{
    exec::{ExecFileSystem, Owner},
    retrier::RetryPolicy,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unable to read {}: {1}", .0.display())]
    Read(PathBuf, #[source] std::io::Error),

    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid linked input directory pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("unable to resolve exec owner: {0}")]
    Owner(#[source] std::io::Error),
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    pub exec: ExecConfig,
    pub cache: CacheConfig,
    pub input_fetch: InputFetchConfig,
    pub cas_write: CasWriteConfig,
    pub backplane: BackplaneConfig,
}

impl WorkerConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| Error::Read(path.to_path_buf(), e))?;
        Ok(toml::from_str(&contents)?)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecConfig {
    pub root: PathBuf,
    /// Whether `linked_input_directories` is used at all.
    pub link_input_directories: bool,
    pub linked_input_directories: Vec<String>,
    pub owner: Option<OwnerConfig>,
    pub allow_symlink_target_absolute: bool,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/farmhand/exec"),
            link_input_directories: false,
            linked_input_directories: vec![],
            owner: None,
            allow_symlink_target_absolute: false,
        }
    }
}

impl ExecConfig {
    pub fn exec_file_system(&self, cache: Arc<dyn Cache>) -> Result<ExecFileSystem, Error> {
        let mut exec = ExecFileSystem::new(self.root.clone(), cache)
            .allow_symlink_target_absolute(self.allow_symlink_target_absolute);

        if self.link_input_directories {
            exec = exec.with_linked_input_directories(&self.linked_input_directories[..])?;
        }

        if let Some(owner) = &self.owner {
            exec = exec.with_owner(
                Owner::lookup(&owner.user, owner.group.as_deref()).map_err(Error::Owner)?,
            );
        }

        Ok(exec)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OwnerConfig {
    pub user: String,
    pub group: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub root: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/farmhand/cache"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InputFetchConfig {
    /// How many exec dirs are materialized at once.
    pub width: u32,
}

impl Default for InputFetchConfig {
    fn default() -> Self {
        Self { width: 4 }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CasWriteConfig {
    pub retry: RetryPolicy,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackplaneConfig {
    pub storage_workers: Vec<String>,
}
