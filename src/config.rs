use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub harvest: HarvestConfig,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub loader: LoaderConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub transform: Option<TransformConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub raw_data_path: PathBuf,
    pub image_path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            base_url: None,
            token_env: default_token_env(),
            timeout_secs: default_timeout_secs(),
            page_size: default_page_size(),
        }
    }
}

impl SourceConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_token_env() -> String {
    "HARVEST_SOURCE_TOKEN".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_page_size() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct HarvestConfig {
    #[serde(default = "default_fetch_limit")]
    pub fetch_limit: usize,
    #[serde(default = "default_true")]
    pub download_media: bool,
    #[serde(default = "default_channel_concurrency")]
    pub max_concurrent_channels: usize,
    /// Persist the messages of a channel that failed part-way.
    #[serde(default)]
    pub keep_partial: bool,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            fetch_limit: default_fetch_limit(),
            download_media: true,
            max_concurrent_channels: default_channel_concurrency(),
            keep_partial: false,
        }
    }
}

fn default_fetch_limit() -> usize {
    200
}
fn default_true() -> bool {
    true
}
fn default_channel_concurrency() -> usize {
    4
}

/// One channel to harvest. Immutable for the duration of a run.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ChannelConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl ChannelConfig {
    /// The per-channel limit, falling back to `harvest.fetch_limit`.
    pub fn fetch_limit(&self, default_limit: usize) -> usize {
        self.limit.unwrap_or(default_limit)
    }
}

/// What the loader does when a message_id is already present.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Insert-if-absent: the existing row wins.
    #[default]
    Ignore,
    /// Latest write wins on every mutable column.
    Update,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoaderConfig {
    #[serde(default)]
    pub on_conflict: ConflictPolicy,
    #[serde(default = "default_loader_workers")]
    pub workers: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            on_conflict: ConflictPolicy::Ignore,
            workers: default_loader_workers(),
        }
    }
}

fn default_loader_workers() -> usize {
    4
}

/// Where the classifier finds the images it runs on.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ImageDiscovery {
    /// Image paths referenced by snapshot records.
    #[default]
    Snapshots,
    /// Every image file under `storage.image_path/<channel>/`.
    Directory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClassifierConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Number of images in flight at once; 1 means a single model instance.
    #[serde(default = "default_classifier_workers")]
    pub workers: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_detect_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_person_classes")]
    pub person_classes: Vec<String>,
    #[serde(default = "default_product_classes")]
    pub product_classes: Vec<String>,
    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,
    #[serde(default)]
    pub discover: ImageDiscovery,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            endpoint: None,
            workers: default_classifier_workers(),
            max_retries: default_max_retries(),
            timeout_secs: default_detect_timeout_secs(),
            person_classes: default_person_classes(),
            product_classes: default_product_classes(),
            image_extensions: default_image_extensions(),
            discover: ImageDiscovery::Snapshots,
        }
    }
}

impl ClassifierConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_classifier_workers() -> usize {
    1
}
fn default_max_retries() -> u32 {
    3
}
fn default_detect_timeout_secs() -> u64 {
    60
}
fn default_person_classes() -> Vec<String> {
    vec!["person".to_string()]
}
fn default_product_classes() -> Vec<String> {
    vec!["bottle".to_string(), "cell phone".to_string()]
}
fn default_image_extensions() -> Vec<String> {
    vec!["jpg".to_string(), "jpeg".to_string(), "png".to_string()]
}

/// External transform step run after classification (e.g. `dbt run`).
#[derive(Debug, Deserialize, Clone)]
pub struct TransformConfig {
    pub command: Vec<String>,
    #[serde(default)]
    pub workdir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Find a configured channel by name.
    pub fn channel(&self, name: &str) -> Option<&ChannelConfig> {
        self.channels.iter().find(|c| c.name == name)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Validate harvest
    if config.harvest.fetch_limit == 0 {
        anyhow::bail!("harvest.fetch_limit must be > 0");
    }
    if config.harvest.max_concurrent_channels == 0 {
        anyhow::bail!("harvest.max_concurrent_channels must be > 0");
    }

    // Validate channels
    let mut seen = HashSet::new();
    for channel in &config.channels {
        if channel.name.trim().is_empty() {
            anyhow::bail!("channel name must not be empty");
        }
        if channel.name.contains(['/', '\\']) || channel.name.starts_with('.') {
            anyhow::bail!(
                "channel name '{}' must be usable as a file name",
                channel.name
            );
        }
        if !seen.insert(channel.name.as_str()) {
            anyhow::bail!("duplicate channel name: '{}'", channel.name);
        }
        if channel.limit == Some(0) {
            anyhow::bail!("channels.{}.limit must be > 0", channel.name);
        }
    }

    // Validate source
    match config.source.provider.as_str() {
        "disabled" => {}
        "http" => {
            if config.source.base_url.is_none() {
                anyhow::bail!("source.base_url must be specified when provider is 'http'");
            }
            if config.source.page_size == 0 {
                anyhow::bail!("source.page_size must be > 0");
            }
        }
        other => anyhow::bail!(
            "Unknown source provider: '{}'. Must be disabled or http.",
            other
        ),
    }

    // Validate loader
    if config.loader.workers == 0 {
        anyhow::bail!("loader.workers must be > 0");
    }

    // Validate classifier
    let classifier = &config.classifier;
    if classifier.workers == 0 {
        anyhow::bail!("classifier.workers must be > 0");
    }
    if classifier.person_classes.is_empty() || classifier.product_classes.is_empty() {
        anyhow::bail!("classifier.person_classes and classifier.product_classes must not be empty");
    }
    match classifier.provider.as_str() {
        "disabled" => {}
        "http" => {
            if classifier.endpoint.is_none() {
                anyhow::bail!("classifier.endpoint must be specified when provider is 'http'");
            }
            if classifier.model.is_none() {
                anyhow::bail!("classifier.model must be specified when provider is 'http'");
            }
        }
        other => anyhow::bail!(
            "Unknown classifier provider: '{}'. Must be disabled or http.",
            other
        ),
    }

    if let Some(transform) = &config.transform {
        if transform.command.is_empty() {
            anyhow::bail!("transform.command must not be empty");
        }
    }

    Ok(())
}
