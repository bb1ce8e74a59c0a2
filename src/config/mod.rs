mod knot;
mod spindle;

use std::path::Path;

use serde::de::DeserializeOwned;

pub use knot::KnotConfig;
pub use spindle::SpindleConfig;

use crate::error::{Error, Result};

/// Loads a TOML config file. Missing keys fall back to each config's defaults.
pub fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)?;
    toml::from_str(&raw).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
}
