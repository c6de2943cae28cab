//! Command implementations for tflock.
//!
//! This module provides the dispatcher that routes CLI commands to their
//! implementations. Every command builds one engine from the `--config` file;
//! none of them start the background loops.

mod config_cmd;
mod health;
mod lock;
mod unlock_pull;

use crate::cli::{Cli, Command, ConfigAction, LockAction};
use std::path::Path;
use tflock::{EngineConfig, LockEngine, LockKey, Result};
use tracing::debug;

/// Dispatch a command to its implementation.
pub fn dispatch(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_path();
    match cli.command {
        Command::Lock(lock_cmd) => match lock_cmd.action {
            LockAction::List(args) => lock::cmd_lock_list(config_path, args),
            LockAction::Release(args) => lock::cmd_lock_release(config_path, args),
            LockAction::Clear(args) => lock::cmd_lock_clear(config_path, args),
        },
        Command::UnlockPull(args) => unlock_pull::cmd_unlock_pull(config_path, args),
        Command::Health => health::cmd_health(config_path),
        Command::Config(config_cmd) => match config_cmd.action {
            ConfigAction::Check(args) => config_cmd::cmd_config_check(config_path, args),
        },
    }
}

/// Load config (defaults when the file is missing) and build the engine.
fn open_engine(config_path: &Path) -> Result<LockEngine> {
    let config = EngineConfig::load_or_default(config_path)?;
    debug!(config = %config_path.display(), data_dir = %config.data_dir.display(), "opening lock engine");
    LockEngine::new(config)
}

fn target_key(target: &crate::cli::LockTarget) -> Result<LockKey> {
    LockKey::new(&target.repository, &target.project, &target.workspace)
}
