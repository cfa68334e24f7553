use std::path::Path;

use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct QuotecastConfig {
    pub platform: PlatformSection,
    pub session: SessionSection,
    pub schedule: ScheduleSection,
    pub content: ContentSection,
    pub fillers: FillerSection,
    pub store: StoreSection,
    #[serde(default)]
    pub alert: AlertSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlatformSection {
    pub live_base_url: String,
    pub tool_base_url: String,
    pub search_url: String,
    pub login_url: String,
    pub user_agent: String,
    pub community_id: String,
    pub category: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    pub account: String,
    pub password: String,
    /// Hex-encoded shared secret for the one-time-password challenge.
    pub otp_secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleSection {
    pub utc_offset_hours: i32,
    pub anchor_hours: Vec<u32>,
    pub slot_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContentSection {
    pub tags: Vec<String>,
    pub request_tags: Vec<String>,
    pub ng_tags: Vec<String>,
    pub ng_videos: Vec<String>,
    pub min_seconds: u32,
    pub max_seconds: u32,
    pub fairness_winners: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FillerSection {
    pub maintenance_video: String,
    pub closing_video: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    pub queue_url: String,
    pub request_url: String,
    pub api_key: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertSection {
    pub webhook_url: Option<String>,
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<QuotecastConfig> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
