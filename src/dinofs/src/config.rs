use std::path::{Path, PathBuf};

use dino_lib::{DinoError, DinoResult};
pub use dino_lib::expand_env;
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mountpoint: String,
    pub name: String,
    pub metadata_server: String,
    pub blob_server: String,
    pub debug: bool,
    pub debug_fuse: bool,
    pub log_path: String,
    pub data_path: String,
}

impl Config {
    pub fn apply_defaults_for_missing_properties(&mut self) {
        if self.mountpoint.is_empty() {
            self.mountpoint = "/n/dino".to_string();
        }
        if self.name.is_empty() {
            self.name = "dinofs".to_string();
        }
        if self.log_path.is_empty() {
            self.log_path = "$HOME/lib/dino/log".to_string();
        }
        if self.data_path.is_empty() {
            self.data_path = "$HOME/lib/dino/data".to_string();
        }
    }
}

pub fn load_config(path: &Path) -> DinoResult<Config> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| DinoError::IoError(format!("read {}: {}", path.display(), e)))?;
    serde_json::from_str(&content)
        .map_err(|e| DinoError::InvalidParam(format!("parse {}: {}", path.display(), e)))
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from(expand_env("$HOME/lib/dino/dinofs.config"))
}
