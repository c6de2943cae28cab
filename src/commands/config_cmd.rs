//! Implementation of the `tflock config check` command.

use crate::cli::ConfigCheckArgs;
use std::path::Path;
use tflock::{EngineConfig, Result};

/// Execute `tflock config check`.
///
/// Unlike the other commands, a missing file is an error here.
pub fn cmd_config_check(config_path: &Path, args: ConfigCheckArgs) -> Result<()> {
    let path = args.path.as_deref().unwrap_or(config_path);
    let config = EngineConfig::load(path)?;

    println!("Config OK: {}", path.display());
    println!(
        "Starts on the {} backend.",
        if config.uses_distributed() {
            "distributed"
        } else {
            "embedded"
        }
    );
    println!();
    print!("{}", config.to_yaml()?);
    Ok(())
}
