//! Config validation CLI tool
//!
//! Validates a bagsimd configuration file and reports any errors.

use bagsim_util::default_config_path;
use std::path::PathBuf;
use std::process::ExitCode;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    let config_path = match args.get(1) {
        Some(path) => PathBuf::from(path),
        None => {
            let default_path = default_config_path();
            eprintln!("Usage: validate-config [config-file]");
            eprintln!();
            eprintln!("Validates a bagsimd configuration file.");
            eprintln!();
            eprintln!("If no path is provided, uses: {}", default_path.display());
            return ExitCode::from(2);
        }
    };

    if !config_path.exists() {
        eprintln!("Error: Configuration file not found: {}", config_path.display());
        return ExitCode::from(1);
    }

    match bagsim_config::load_config(&config_path) {
        Ok(settings) => {
            let sim = &settings.simulation;
            println!("✓ Configuration is valid");
            println!();
            println!("Summary:");
            println!("  Config version: {}", bagsim_config::CURRENT_CONFIG_VERSION);
            println!("  Listen address: {}", settings.service.listen_addr);
            println!("  Data directory: {}", settings.service.data_dir.display());
            println!(
                "  Admin passkey:  {}",
                if settings.service.admin_passkey.is_some() { "set" } else { "not set" }
            );
            println!("  Tick interval:  {} ms", sim.tick_interval.as_millis());
            println!("  Battery drain:  {}-{}% per tick", sim.drain.min, sim.drain.max);
            println!("  Store timeout:  {} ms", sim.store_timeout.as_millis());
            println!("  First tick:     {:?}", sim.first_tick);

            if !settings.devices.is_empty() {
                println!();
                println!("Seed devices:");
                for device in &settings.devices {
                    let owner = device.owner.as_deref().unwrap_or("unclaimed");
                    println!(
                        "  - {} [{}%, {}]: {}",
                        device.code,
                        device.battery_level,
                        if device.status { "on" } else { "off" },
                        owner
                    );
                }
            }

            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed");
            eprintln!();
            match &e {
                bagsim_config::ConfigError::ReadError(io_err) => {
                    eprintln!("Failed to read file: {}", io_err);
                }
                bagsim_config::ConfigError::ParseError(parse_err) => {
                    eprintln!("TOML parse error:");
                    eprintln!("  {}", parse_err);
                }
                bagsim_config::ConfigError::ValidationFailed { errors } => {
                    eprintln!("Validation errors ({}):", errors.len());
                    for err in errors {
                        eprintln!("  - {}", err);
                    }
                }
                bagsim_config::ConfigError::UnsupportedVersion(ver) => {
                    eprintln!(
                        "Unsupported config version: {} (expected {})",
                        ver,
                        bagsim_config::CURRENT_CONFIG_VERSION
                    );
                }
            }
            ExitCode::from(1)
        }
    }
}
