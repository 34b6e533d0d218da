//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

const MB: u64 = 1024 * 1024;

/// Location of the managed work tree and of the indexed content tree
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathsConfig {
    /// Root holding Input/Processing/Output/Failed/Temp/Trash/Log and the catalog
    #[serde(default = "default_work_path")]
    pub work_path: PathBuf,
    /// Content tree to index (empty disables the indexer)
    #[serde(default)]
    pub indexer_path: PathBuf,
}

fn default_work_path() -> PathBuf {
    PathBuf::from("Data")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            work_path: default_work_path(),
            indexer_path: PathBuf::new(),
        }
    }
}

/// Indexer eligibility rules
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexerConfig {
    /// Allowed extensions, with leading dot, matched case-insensitively
    #[serde(default = "default_video_extensions")]
    pub video_extensions: Vec<String>,
    /// Files below this size are not indexed
    #[serde(default = "default_min_file_size_mb")]
    pub min_file_size_mb: u64,
    /// Folder names never descended into
    #[serde(default)]
    pub ignore_folders: Vec<String>,
    /// Wait after a create event before probing the new file
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
}

fn default_video_extensions() -> Vec<String> {
    [".mp4", ".mkv", ".avi", ".mov", ".m4v", ".wmv", ".ts", ".m2ts"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_min_file_size_mb() -> u64 {
    100
}

fn default_settle_delay_ms() -> u64 {
    1000
}

impl IndexerConfig {
    pub fn min_file_size_bytes(&self) -> u64 {
        self.min_file_size_mb.saturating_mul(MB)
    }
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            video_extensions: default_video_extensions(),
            min_file_size_mb: default_min_file_size_mb(),
            ignore_folders: Vec::new(),
            settle_delay_ms: default_settle_delay_ms(),
        }
    }
}

/// Encoder and validator settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    /// Constant-quality value handed to the GPU encoder (lower = better quality)
    #[serde(default = "default_quality_level")]
    pub quality_level: u8,
    /// Refuse GPU encoding; with no CPU path this leaves no eligible encoder
    #[serde(default)]
    pub force_cpu: bool,
    /// NVENC preset
    #[serde(default = "default_nvidia_preset")]
    pub nvidia_preset: String,
    /// Max allowed duration difference between source and candidate
    #[serde(default = "default_duration_tolerance_secs")]
    pub duration_tolerance_secs: f64,
    /// Max allowed framerate difference between source and candidate
    #[serde(default = "default_fps_tolerance")]
    pub fps_tolerance: f64,
    /// Number of windows sampled when re-measuring a source framerate
    #[serde(default = "default_fps_sample_windows")]
    pub fps_sample_windows: u32,
}

fn default_quality_level() -> u8 {
    23
}

fn default_nvidia_preset() -> String {
    "p7".to_string()
}

fn default_duration_tolerance_secs() -> f64 {
    0.5
}

fn default_fps_tolerance() -> f64 {
    2.0
}

fn default_fps_sample_windows() -> u32 {
    3
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            quality_level: default_quality_level(),
            force_cpu: false,
            nvidia_preset: default_nvidia_preset(),
            duration_tolerance_secs: default_duration_tolerance_secs(),
            fps_tolerance: default_fps_tolerance(),
            fps_sample_windows: default_fps_sample_windows(),
        }
    }
}

/// Worker loop timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Delay before the first poll after startup
    #[serde(default = "default_startup_delay_ms")]
    pub startup_delay_ms: u64,
    /// Backoff between readiness checks of a locked/empty input file
    #[serde(default = "default_file_ready_backoff_ms")]
    pub file_ready_backoff_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_startup_delay_ms() -> u64 {
    5000
}

fn default_file_ready_backoff_ms() -> u64 {
    5000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            startup_delay_ms: default_startup_delay_ms(),
            file_ready_backoff_ms: default_file_ready_backoff_ms(),
        }
    }
}

/// Default rule for "re-encode everything over threshold"
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelectionConfig {
    /// QualityRatio above which an original is considered over-provisioned
    #[serde(default = "default_encoding_threshold")]
    pub encoding_threshold: f64,
    #[serde(default = "default_min_file_size_mb")]
    pub min_file_size_mb: u64,
    /// Files modified more recently than this are left alone
    #[serde(default = "default_min_file_age_hours")]
    pub min_file_age_hours: f64,
}

fn default_encoding_threshold() -> f64 {
    0.2
}

fn default_min_file_age_hours() -> f64 {
    24.0
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            encoding_threshold: default_encoding_threshold(),
            min_file_size_mb: default_min_file_size_mb(),
            min_file_age_hours: default_min_file_age_hours(),
        }
    }
}

/// Trash retention
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrashConfig {
    /// Most recent trash entries kept; older ones are purged
    #[serde(default = "default_keep_files")]
    pub keep_files: usize,
}

fn default_keep_files() -> usize {
    2
}

impl Default for TrashConfig {
    fn default() -> Self {
        Self {
            keep_files: default_keep_files(),
        }
    }
}

/// Periodic housekeeping
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MaintenanceConfig {
    #[serde(default = "default_maintenance_interval_secs")]
    pub interval_secs: u64,
}

fn default_maintenance_interval_secs() -> u64 {
    600
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_maintenance_interval_secs(),
        }
    }
}

/// Control surface
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:7979".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub indexer: IndexerConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub selection: SelectionConfig,
    #[serde(default)]
    pub trash: TrashConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - SQUEEZE_WORK_PATH -> paths.work_path
    /// - SQUEEZE_INDEXER_PATH -> paths.indexer_path
    /// - SQUEEZE_QUALITY_LEVEL -> encoder.quality_level
    /// - SQUEEZE_FORCE_CPU -> encoder.force_cpu
    /// - SQUEEZE_MIN_FILE_SIZE_MB -> indexer.min_file_size_mb
    /// - SQUEEZE_SERVER_BIND -> server.bind
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("SQUEEZE_WORK_PATH") {
            if !val.is_empty() {
                self.paths.work_path = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("SQUEEZE_INDEXER_PATH") {
            self.paths.indexer_path = PathBuf::from(val);
        }

        if let Ok(val) = env::var("SQUEEZE_QUALITY_LEVEL") {
            if let Ok(level) = val.parse::<u8>() {
                self.encoder.quality_level = level;
            }
        }

        if let Ok(val) = env::var("SQUEEZE_FORCE_CPU") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.encoder.force_cpu = true,
                "false" | "0" | "no" => self.encoder.force_cpu = false,
                _ => {} // Invalid value, keep existing
            }
        }

        if let Ok(val) = env::var("SQUEEZE_MIN_FILE_SIZE_MB") {
            if let Ok(mb) = val.parse::<u64>() {
                self.indexer.min_file_size_mb = mb;
            }
        }

        if let Ok(val) = env::var("SQUEEZE_SERVER_BIND") {
            if !val.is_empty() {
                self.server.bind = val;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }
}
