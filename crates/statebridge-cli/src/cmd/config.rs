use crate::output::print_json;
use anyhow::{Context, Result};
use clap::Subcommand;
use statebridge_core::config::{ConfigWarning, WarnLevel};
use statebridge_core::BridgeConfig;
use std::path::Path;

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Print the effective config and any warnings (default)
    Show,
    /// Check the config and fail if it has errors
    Validate,
}

/// Load the config file, or fall back to defaults when none is given.
pub fn load(path: Option<&Path>) -> Result<BridgeConfig> {
    match path {
        Some(path) => BridgeConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(BridgeConfig::default()),
    }
}

pub fn run(path: Option<&Path>, subcommand: Option<ConfigSubcommand>, json: bool) -> Result<()> {
    let config = load(path)?;
    match subcommand.unwrap_or(ConfigSubcommand::Show) {
        ConfigSubcommand::Show => show(&config, json),
        ConfigSubcommand::Validate => validate(&config, json),
    }
}

// ---------------------------------------------------------------------------
// show
// ---------------------------------------------------------------------------

fn show(config: &BridgeConfig, json: bool) -> Result<()> {
    let warnings = config.validate();

    if json {
        let value = serde_json::json!({
            "config": config,
            "warnings": warnings,
        });
        return print_json(&value);
    }

    print!("{}", serde_yaml::to_string(config)?);
    if !warnings.is_empty() {
        println!();
        print_warnings(&warnings);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

fn validate(config: &BridgeConfig, json: bool) -> Result<()> {
    let warnings = config.validate();

    if json {
        let value = serde_json::json!({
            "warnings": warnings,
        });
        print_json(&value)?;
    } else if warnings.is_empty() {
        println!("Config is valid. No warnings.");
    } else {
        print_warnings(&warnings);
    }

    if has_errors(&warnings) {
        anyhow::bail!("config validation found errors");
    }

    Ok(())
}

fn print_warnings(warnings: &[ConfigWarning]) {
    for w in warnings {
        let prefix = match w.level {
            WarnLevel::Warning => "warning",
            WarnLevel::Error => "error",
        };
        println!("[{prefix}] {}", w.message);
    }
}

fn has_errors(warnings: &[ConfigWarning]) -> bool {
    warnings.iter().any(|w| w.level == WarnLevel::Error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn no_path_means_defaults() {
        assert_eq!(load(None).unwrap(), BridgeConfig::default());
    }

    #[test]
    fn load_error_names_the_file() {
        let err = load(Some(Path::new("/nonexistent/statebridge.yaml"))).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/statebridge.yaml"));
    }

    #[test]
    fn zero_depth_fails_validation() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_serialization_depth: 0").unwrap();
        let config = load(Some(file.path())).unwrap();
        assert!(has_errors(&config.validate()));
        assert!(validate(&config, true).is_err());
    }

    #[test]
    fn short_timeout_is_only_a_warning() {
        let config = BridgeConfig {
            dispatch_timeout_ms: 100,
            ..BridgeConfig::default()
        };
        let warnings = config.validate();
        assert_eq!(warnings.len(), 1);
        assert!(!has_errors(&warnings));
        assert!(validate(&config, true).is_ok());
    }
}
