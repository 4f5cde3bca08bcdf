//! Configuration view and validation commands: `autopilot config`.

use anyhow::Result;
use std::path::Path;

use autopilot::autopilot_config::{AutopilotToml, CONFIG_FILE};
use autopilot::config::Config;
use autopilot::planning;

use super::super::ConfigCommands;

fn print_file_values(toml: &AutopilotToml) {
    println!("[agent]");
    if let Some(cmd) = &toml.agent.claude_cmd {
        println!("  claude_cmd = \"{}\"", cmd);
    }
    println!("  skip_permissions = {}", toml.agent.skip_permissions);
    println!("  timeout_secs = {}", toml.agent.timeout_secs);
    if !toml.agent.extra_flags.is_empty() {
        println!("  extra_flags = {:?}", toml.agent.extra_flags);
    }
    println!();
    println!("[workflow]");
    println!("  skip_discuss = {}", toml.workflow.skip_discuss);
    println!("  skip_verify = {}", toml.workflow.skip_verify);
    println!();
    println!("[logging]");
    println!("  json_file = {}", toml.logging.json_file);
    println!();
}

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let planning_dir = planning::planning_dir(project_dir);
    let config_path = planning_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Autopilot Configuration");
            println!("=======================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
                println!();
                print_file_values(&AutopilotToml::load(&config_path)?);
            } else {
                println!("No {} found at {}", CONFIG_FILE, config_path.display());
                println!();
                println!("Using default configuration:");
                print_file_values(&AutopilotToml::default());
                println!("Run 'autopilot config init' to create one.");
                println!();
            }

            println!("Effective values (with env overrides):");
            let config = Config::new(project_dir, false)?;
            println!("  claude_cmd = \"{}\"", config.claude_cmd);
            println!("  skip_permissions = {}", config.skip_permissions);
            println!("  timeout_secs = {}", config.step_timeout.as_secs());
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            if !config_path.exists() {
                println!("No {} found. Using defaults (valid).", CONFIG_FILE);
                return Ok(());
            }

            let warnings = AutopilotToml::load(&config_path)?.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("{} already exists at {}", CONFIG_FILE, config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&planning_dir)?;
            AutopilotToml::default().save(&config_path)?;

            println!("Created {} at {}", CONFIG_FILE, config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [agent] claude_cmd, skip_permissions, timeout_secs, extra_flags");
            println!("  - [workflow] skip_discuss, skip_verify");
            println!("  - [logging] json_file");
            println!();
        }
    }

    Ok(())
}
