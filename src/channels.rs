use anyhow::Result;

use crate::config::Config;

/// Print the configured channels, their fetch limits, and the providers in use.
pub fn list_channels(config: &Config) -> Result<()> {
    let source_status = if config.source.is_enabled() {
        config
            .source
            .base_url
            .as_deref()
            .unwrap_or("NOT CONFIGURED")
            .to_string()
    } else {
        "DISABLED".to_string()
    };
    let classifier_status = if config.classifier.is_enabled() {
        config.classifier.model.as_deref().unwrap_or("NOT CONFIGURED").to_string()
    } else {
        "DISABLED".to_string()
    };

    println!("source:     {} ({})", config.source.provider, source_status);
    println!("classifier: {} ({})", config.classifier.provider, classifier_status);
    println!();

    if config.channels.is_empty() {
        println!("No channels configured.");
        return Ok(());
    }

    println!("{:<24} {:>6}  URL", "CHANNEL", "LIMIT");
    for channel in &config.channels {
        println!(
            "{:<24} {:>6}  {}",
            channel.name,
            channel.fetch_limit(config.harvest.fetch_limit),
            channel.url
        );
    }

    Ok(())
}
