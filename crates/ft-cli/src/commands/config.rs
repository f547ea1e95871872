//! Config command implementations
//!
//! These edit `settings.toml` only. The tunnel registry is managed through
//! the tunnel and service commands.

use std::path::Path;

use anyhow::{Context, Result};

use crate::output::{print_error, print_info, print_success};
use ft_core::config::{self, Settings};

/// Keys accepted by `config get` and `config set`
pub const SETTINGS_KEYS: &[&str] = &[
    "cloudflared_bin",
    "cloudflared_dir",
    "health_timeout_ms",
    "log_file",
];

fn settings_path(config_dir: &Path) -> std::path::PathBuf {
    config_dir.join(config::SETTINGS_FILE_NAME)
}

fn check_key(key: &str) -> Result<()> {
    if !SETTINGS_KEYS.contains(&key) {
        anyhow::bail!(
            "Unknown setting '{}' (expected one of: {})",
            key,
            SETTINGS_KEYS.join(", ")
        );
    }
    Ok(())
}

/// Show the effective settings
pub fn config_show(config_dir: &Path) -> Result<()> {
    let path = settings_path(config_dir);
    let settings = Settings::load_or_default(&path)
        .with_context(|| format!("Failed to load settings from {:?}", path))?;

    if path.exists() {
        print_info(&format!("Settings file: {}", path.display()));
    } else {
        print_info(&format!("Settings file: {} (not created, showing defaults)", path.display()));
    }
    println!();
    println!("{}", toml::to_string_pretty(&settings)?);
    Ok(())
}

/// Print the config directory
pub fn config_path(config_dir: &Path) -> Result<()> {
    println!("{}", config_dir.display());
    Ok(())
}

/// Get an effective setting by key
pub fn config_get(config_dir: &Path, key: &str) -> Result<()> {
    check_key(key)?;

    let path = settings_path(config_dir);
    let settings = Settings::load_or_default(&path)
        .with_context(|| format!("Failed to load settings from {:?}", path))?;
    let value = toml::Value::try_from(&settings)?;

    match value.get(key) {
        Some(toml::Value::String(s)) => println!("{}", s),
        Some(value) => println!("{}", value),
        None => print_error(&format!("{} is not set", key)),
    }
    Ok(())
}

/// Set a setting by key, keeping the rest of the file
pub fn config_set(config_dir: &Path, key: &str, value: &str) -> Result<()> {
    check_key(key)?;

    let path = settings_path(config_dir);
    let mut table: toml::Table = if path.exists() {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read settings file: {:?}", path))?;
        toml::from_str(&content).with_context(|| "Failed to parse settings file")?
    } else {
        toml::Table::new()
    };

    let toml_value = if let Ok(i) = value.parse::<i64>() {
        toml::Value::Integer(i)
    } else {
        toml::Value::String(value.to_string())
    };
    table.insert(key.to_string(), toml_value);

    // Reject values that would make the file unloadable
    toml::Value::Table(table.clone())
        .try_into::<Settings>()
        .with_context(|| format!("Invalid value for {}: {}", key, value))?;

    config::save_config(&path, &table)
        .with_context(|| format!("Failed to write settings file: {:?}", path))?;

    print_success(&format!("Set {} = {}", key, value));
    Ok(())
}
