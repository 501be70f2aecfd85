use crate::ConfigCommands;
use anyhow::{Result, bail};
use pharos::config::{PharosConfig, PharosToml};
use pharos::gatherers::BUILTIN_GATHERERS;

pub fn cmd_config(config: &PharosConfig, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = &config.config_path;

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Pharos Configuration");
            println!("====================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No pharos.toml found at {}", config_path.display());
                println!("Using default configuration.");
            }
            println!();

            let toml = &config.toml;
            println!("[connection]");
            println!("  endpoint = \"{}\"", toml.connection.endpoint);
            println!();

            println!("[artifacts]");
            if toml.artifacts.is_empty() {
                println!("  (all built-in gatherers: {})", BUILTIN_GATHERERS.join(", "));
            }
            for entry in &toml.artifacts {
                print!("  {} = {}", entry.id, entry.gatherer);
                if !entry.dependencies.is_empty() {
                    let deps: Vec<String> = entry
                        .dependencies
                        .iter()
                        .map(|(key, id)| format!("{key} <- {id}"))
                        .collect();
                    print!(" ({})", deps.join(", "));
                }
                println!();
            }
            println!();

            println!("Effective values (with env/CLI overrides):");
            let settings = config.settings()?;
            println!("  endpoint = \"{}\"", config.endpoint());
            println!("  throttling_method = \"{}\"", settings.throttling_method);
            println!("  load_failure_mode = \"{}\"", settings.load_failure_mode);
            println!("  disable_storage_reset = {}", settings.disable_storage_reset);
            println!("  max_wait_for_load_ms = {}", settings.max_wait_for_load_ms);
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No pharos.toml found. Using defaults (valid).");
                return Ok(());
            }

            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in &warnings {
                    println!("  - {}", warning);
                }
                println!();
                bail!("{} configuration warning(s)", warnings.len());
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("pharos.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }
            if let Some(parent) = config_path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)?;
            }

            PharosToml::starter().save(config_path)?;

            println!("Created pharos.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [connection] endpoint");
            println!("  - [settings] throttling, emulation, load_failure_mode, timeouts");
            println!("  - [[artifacts]] which gatherers run and how they depend on each other");
            println!();
        }
    }

    Ok(())
}
