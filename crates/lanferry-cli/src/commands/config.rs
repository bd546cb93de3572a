//! `lanferry config` - show the configuration.

use anyhow::Result;

use crate::commands::ConfigArgs;
use crate::config::Config;

pub fn run(args: &ConfigArgs) -> Result<()> {
    let config = Config::load()?;

    if args.init {
        config.save()?;
        println!("Wrote {}", Config::path().display());
    }

    println!("config file: {}", Config::path().display());
    println!("device_name: {}", config.device_name);
    println!(
        "receive_root: {}",
        config
            .receive_root
            .as_ref()
            .map_or_else(|| "(unset)".to_string(), |p| p.display().to_string())
    );
    println!(
        "password: {}",
        if config.password.is_some() {
            "(set)"
        } else {
            "(unset)"
        }
    );
    println!("announce: {}", config.announce);
    Ok(())
}
