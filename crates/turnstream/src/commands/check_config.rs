//! `turnstream check-config` - show the effective configuration.

use anyhow::{Context, Result};

use turnstream::config::Config;

use super::OutputFormat;

pub async fn run(config_path: &str, format: OutputFormat) -> Result<()> {
    let config = Config::load(config_path)
        .await
        .with_context(|| format!("invalid configuration in '{config_path}'"))?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&config)?),
        OutputFormat::Text => {
            println!("config: {config_path}");
            println!("projection.debounce_ms: {}", config.projection.debounce_ms);
            println!("dedup.window_capacity: {}", config.dedup.window_capacity);
            println!("notifications.enabled: {}", config.notifications.enabled);
            println!("engine.channel_capacity: {}", config.engine.channel_capacity);
            println!("engine.event_capacity: {}", config.engine.event_capacity);
        }
    }
    Ok(())
}
