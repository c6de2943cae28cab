//! Implementation of the `tflock lock` subcommands.

use super::{open_engine, target_key};
use crate::cli::{LockClearArgs, LockListArgs, LockReleaseArgs};
use globset::Glob;
use std::path::Path;
use tflock::{LockError, LockRecord, Result};

/// Execute `tflock lock list`.
pub fn cmd_lock_list(config_path: &Path, args: LockListArgs) -> Result<()> {
    let engine = open_engine(config_path)?;
    let locks = filter_locks(engine.list_locks()?, args.filter.as_deref())?;

    if locks.is_empty() {
        println!("No active locks.");
        return Ok(());
    }

    println!("Active locks ({}) on {} backend:", locks.len(), engine.mode());
    println!();

    for lock in &locks {
        println!("  {}:", lock.key);
        println!("    Holder:     {}", lock.holder_id);
        if !lock.owner.is_empty() {
            println!("    Owner:      {}", lock.owner);
        }
        println!("    Acquired:   {}", lock.acquired_at.format("%Y-%m-%d %H:%M:%S UTC"));
        println!("    Age:        {}", lock.age_string());
        println!("    Expires:    {}", lock.expires_at.format("%Y-%m-%d %H:%M:%S UTC"));
        if lock.priority != 0 {
            println!("    Priority:   {}", lock.priority);
        }
        if lock.pending_migration {
            println!("    Status:     granted during fallback, not yet reconciled");
        }
        println!();
    }

    Ok(())
}

/// Execute `tflock lock release`.
pub fn cmd_lock_release(config_path: &Path, args: LockReleaseArgs) -> Result<()> {
    let key = target_key(&args.target)?;
    let engine = open_engine(config_path)?;

    if !engine.release(&key, &args.holder)? {
        return Err(LockError::NotHolder {
            key: key.to_string(),
            holder_id: args.holder,
        });
    }

    println!("Released lock '{}' held by '{}'.", key, args.holder);
    Ok(())
}

/// Execute `tflock lock clear`.
pub fn cmd_lock_clear(config_path: &Path, args: LockClearArgs) -> Result<()> {
    let key = target_key(&args.target)?;

    if !args.force {
        return Err(LockError::Config(format!(
            "refusing to clear lock without --force flag.\n\n\
             Clearing a lock lets another job run while the holder may still be active.\n\
             Only clear locks if you are certain the holding job has died.\n\n\
             To clear the lock, run:\n  tflock lock clear {} {} {} --force",
            args.target.repository, args.target.project, args.target.workspace
        )));
    }

    let engine = open_engine(config_path)?;
    match engine.clear_lock(&key)? {
        Some(record) => {
            println!("Cleared lock '{}'.", key);
            println!("  Holder: {}", record.holder_id);
            println!("  Age:    {}", record.age_string());
        }
        None => println!("No active lock on '{}'.", key),
    }
    Ok(())
}

/// Keep records whose `<repo>/<project>/<workspace>` matches `pattern`.
fn filter_locks(locks: Vec<LockRecord>, pattern: Option<&str>) -> Result<Vec<LockRecord>> {
    let Some(pattern) = pattern else {
        return Ok(locks);
    };
    let matcher = Glob::new(pattern)
        .map_err(|e| LockError::Config(format!("invalid --filter glob '{}': {}", pattern, e)))?
        .compile_matcher();

    Ok(locks
        .into_iter()
        .filter(|record| matcher.is_match(record.key.to_string()))
        .collect())
}
