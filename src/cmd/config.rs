//! Configuration view and validation commands — `autoforge config`.

use anyhow::{Context, Result, bail};
use console::style;

use super::super::{Cli, ConfigCommands};
use autoforge::config::{AutoforgeConfig, CONFIG_FILE_NAME};

pub fn cmd_config(cli: &Cli, config: &AutoforgeConfig, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = cli.state_dir.join(CONFIG_FILE_NAME);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("{}", style("Autoforge Configuration").bold());
            if config_path.exists() {
                println!("{}", style(format!("# {}", config_path.display())).dim());
            } else {
                println!("{}", style("# defaults (no autoforge.toml found)").dim());
            }
            println!();
            let rendered = toml::to_string_pretty(config).context("Failed to render configuration")?;
            println!("{}", rendered);
        }
        Some(ConfigCommands::Validate) => {
            let problems = config.validate();
            if problems.is_empty() {
                println!("{} configuration is valid", style("✓").green());
            } else {
                for problem in &problems {
                    println!("  {} {}", style("✗").red(), problem);
                }
                bail!("{} configuration problem(s)", problems.len());
            }
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("{} already exists", config_path.display());
                return Ok(());
            }
            std::fs::create_dir_all(&cli.state_dir)
                .with_context(|| format!("Failed to create {}", cli.state_dir.display()))?;
            AutoforgeConfig::default().save(&config_path)?;
            println!("{} wrote {}", style("✓").green(), config_path.display());
        }
    }
    Ok(())
}
