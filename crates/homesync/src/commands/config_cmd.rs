//! Config subcommand handlers.

use std::path::PathBuf;

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts};
use crate::error::CliError;

const REDACTED: &str = "<redacted>";

fn resolved_path(global: &GlobalOpts) -> PathBuf {
    global
        .config
        .clone()
        .unwrap_or_else(homesync_config::config_path)
}

pub fn handle(args: &ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        ConfigCommand::Path => {
            println!("{}", resolved_path(global).display());
        }

        ConfigCommand::Init { force } => {
            let path = resolved_path(global);
            homesync_config::write_default_config(&path, force)?;
            eprintln!("Wrote default config to {}", path.display());
        }

        ConfigCommand::Show => {
            let mut config = homesync_config::load_config(global.config.as_deref())?;
            if config.hub.token.is_some() {
                config.hub.token = Some(REDACTED.into());
            }
            let rendered = toml::to_string_pretty(&config)
                .map_err(|e| CliError::ConfigRender(e.to_string()))?;
            print!("{rendered}");
        }
    }
    Ok(())
}
