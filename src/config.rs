//! TOML loading for queue options: `toml::from_str` over a
//! `serde::Deserialize` struct, generalized into one small helper both
//! [`crate::normal::QueueOptions`] and [`crate::simple::SimpleQueueOptions`]
//! build their `from_toml_*` constructors on, rather than duplicating
//! the read-then-parse dance.
//!
//! This module is a convenience layer only: nothing in the queue core
//! requires going through a file.

use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::de::DeserializeOwned;

use crate::error::{QueueError, Result};

pub fn from_toml_str<T: DeserializeOwned>(s: &str) -> Result<T> {
    toml::from_str(s).map_err(|e| QueueError::InvalidOption(format!("invalid TOML: {e}")))
}

pub fn from_toml_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let load = || -> anyhow::Result<T> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config file '{}'", path.display()))?;
        let value = toml::from_str(&text)
            .with_context(|| format!("parsing TOML in '{}'", path.display()))?;
        Ok(value)
    };
    load().map_err(|e| QueueError::InvalidOption(e.to_string()))
}
