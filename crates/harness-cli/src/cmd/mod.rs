pub mod config;
pub mod feature;
pub mod init;
pub mod session;
pub mod status;
pub mod update;
pub mod verify;

use anyhow::Context;
use harness_core::registry::Registry;
use std::path::Path;

pub(crate) fn open_registry(root: &Path) -> anyhow::Result<Registry> {
    Registry::open(root).context("failed to load config")
}
