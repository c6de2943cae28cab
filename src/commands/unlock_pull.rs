//! Implementation of the `tflock unlock-pull` command.
//!
//! Run when a pull request is merged or closed, so its plans stop blocking
//! other pull requests.

use super::open_engine;
use crate::cli::UnlockPullArgs;
use std::path::Path;
use tflock::Result;

/// Execute `tflock unlock-pull`.
pub fn cmd_unlock_pull(config_path: &Path, args: UnlockPullArgs) -> Result<()> {
    let engine = open_engine(config_path)?;
    let released = engine.unlock_by_pull(&args.repository, args.pull)?;

    if released.is_empty() {
        println!(
            "No locks held by pull request #{} in {}.",
            args.pull, args.repository
        );
        return Ok(());
    }

    println!(
        "Released {} lock(s) held by pull request #{}:",
        released.len(),
        args.pull
    );
    for record in &released {
        println!("  {} ({})", record.key, record.holder_id);
    }
    Ok(())
}
