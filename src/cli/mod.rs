//! CLI argument parsing for tflock.
//!
//! Uses clap derive macros for declarative argument definitions.
//! This module defines the command structure; actual implementations
//! are in the `commands` module.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// tflock: operator tool for the Terraform project-workspace locking engine.
///
/// Locks are held by automation jobs; these commands inspect them, clear
/// stuck ones, and check backend health.
#[derive(Parser, Debug)]
#[command(name = "tflock")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Engine configuration file. A missing file means defaults.
    #[arg(long, global = true, default_value = "tflock.yaml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands for tflock.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Lock management commands.
    ///
    /// List, release, or clear project-workspace locks.
    Lock(LockCommand),

    /// Release every lock held by a pull request.
    ///
    /// Matches holder ids `pr-<pull>` and `pr-<pull>-<suffix>` in the repository.
    UnlockPull(UnlockPullArgs),

    /// Show backend mode, reachability, and queue state.
    Health,

    /// Configuration commands.
    Config(ConfigCommand),
}

/// Arguments for the `lock` command.
#[derive(Parser, Debug)]
pub struct LockCommand {
    #[command(subcommand)]
    pub action: LockAction,
}

/// Available lock actions.
#[derive(Subcommand, Debug)]
pub enum LockAction {
    /// List all live locks on the active backend.
    List(LockListArgs),

    /// Release a lock on behalf of its holder.
    ///
    /// Fails if the given holder does not hold the lock.
    Release(LockReleaseArgs),

    /// Clear a lock regardless of its holder.
    ///
    /// Requires --force flag to prevent accidental clearing.
    Clear(LockClearArgs),
}

/// Identifies one project-workspace.
#[derive(Parser, Debug)]
pub struct LockTarget {
    /// Repository full name, e.g. `org/infra`.
    pub repository: String,

    /// Project directory relative to the repository root.
    pub project: String,

    /// Terraform workspace.
    #[arg(default_value = "default")]
    pub workspace: String,
}

/// Arguments for the `lock list` command.
#[derive(Parser, Debug)]
pub struct LockListArgs {
    /// Only show locks whose `<repo>/<project>/<workspace>` matches this glob.
    #[arg(long)]
    pub filter: Option<String>,
}

/// Arguments for the `lock release` command.
#[derive(Parser, Debug)]
pub struct LockReleaseArgs {
    #[command(flatten)]
    pub target: LockTarget,

    /// Holder id the lock was granted to, e.g. `pr-42-plan`.
    #[arg(long)]
    pub holder: String,
}

/// Arguments for the `lock clear` command.
#[derive(Parser, Debug)]
pub struct LockClearArgs {
    #[command(flatten)]
    pub target: LockTarget,

    /// Force clearing the lock (required for safety).
    #[arg(long)]
    pub force: bool,
}

/// Arguments for the `unlock-pull` command.
#[derive(Parser, Debug)]
pub struct UnlockPullArgs {
    /// Repository full name, e.g. `org/infra`.
    pub repository: String,

    /// Pull request number.
    pub pull: u64,
}

/// Arguments for the `config` command.
#[derive(Parser, Debug)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub action: ConfigAction,
}

/// Available config actions.
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Parse and validate a configuration file, then print the effective values.
    Check(ConfigCheckArgs),
}

/// Arguments for the `config check` command.
#[derive(Parser, Debug)]
pub struct ConfigCheckArgs {
    /// File to check instead of `--config`.
    #[arg(long)]
    pub path: Option<PathBuf>,
}

impl Cli {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
