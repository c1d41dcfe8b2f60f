use std::sync::Arc;
use std::time::Duration;

use crate::recovery::{ExponentialBackoff, FixedDelay, RecoveryPolicy, DEFAULT_RETRY_DELAY};

pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8080/ws";
pub const DEFAULT_PLAYLIST_PATH: &str = "hls/playlist.m3u8";
pub const DEFAULT_HLS_BASE_URL: &str = "http://127.0.0.1:8080/";
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryMode {
    #[default]
    Fixed,
    Exponential,
}

/// How recovery attempts are spaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    pub mode: RetryMode,
    /// Fixed delay, or the first delay when exponential.
    pub delay: Duration,
    /// Upper bound for exponential delays.
    pub max_delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            mode: RetryMode::Fixed,
            delay: DEFAULT_RETRY_DELAY,
            max_delay: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> Arc<dyn RecoveryPolicy> {
        match self.mode {
            RetryMode::Fixed => Arc::new(FixedDelay {
                delay: self.delay,
                max_attempts: self.max_attempts,
            }),
            RetryMode::Exponential => Arc::new(ExponentialBackoff {
                initial: self.delay,
                max: self.max_delay.max(self.delay),
                max_attempts: self.max_attempts,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub signaling_url: String,
    pub ice_servers: Vec<String>,
    pub retry: RetryConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdaptiveConfig {
    /// Base the playlist path is resolved against.
    pub base_url: String,
    pub playlist_path: String,
    /// Report an unbounded duration for live playlists.
    pub live_duration_infinity: bool,
    pub request_timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_HLS_BASE_URL.to_string(),
            playlist_path: DEFAULT_PLAYLIST_PATH.to_string(),
            live_duration_infinity: true,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retry: RetryConfig::default(),
        }
    }
}
