//! Optional logging bootstrap for host binaries. The crate itself only
//! ever calls `log::{debug,trace,warn}` and never configures a backend;
//! this wrapper exists purely so an embedder can reuse a ready-made
//! `log4rs` setup instead of hand-rolling one.

use std::path::Path;

use anyhow::Context;

/// Initializes `log4rs` from a YAML/TOML config file. Never called
/// internally by the crate.
pub fn init_from_file(path: &Path) -> anyhow::Result<()> {
    log4rs::init_file(path, Default::default())
        .with_context(|| format!("initializing log4rs from '{}'", path.display()))?;
    Ok(())
}
