//! Connection and playback configuration.

use serde_json::json;
use std::time::Duration;

/// Default relay endpoint used when nothing else is configured.
pub const DEFAULT_URL: &str = "ws://localhost:8080/ws";

/// Configuration for the live protocol client
#[derive(Debug, Clone)]
pub struct LiveConfig {
    /// WebSocket endpoint of the relay in front of the model
    pub url: String,
    /// Correlation identifiers carried in the setup handshake
    pub session_context: Option<serde_json::Value>,
    /// Scripted opening utterance sent once after the setup acknowledgement
    pub opening_prompt: Option<String>,
    pub opening_delay: Duration,
    /// Deadline used by `ensure_connected`
    pub connect_timeout: Duration,
    /// Caller-driven retry policy; the client itself never retries
    pub reconnect_attempts: usize,
    pub reconnect_delay: Duration,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            session_context: None,
            opening_prompt: None,
            opening_delay: Duration::from_millis(1000),
            connect_timeout: Duration::from_millis(5000),
            reconnect_attempts: 3,
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

impl LiveConfig {
    /// Build a configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("INTERVIEW_LIVE_URL") {
            config.url = url;
        }
        config.session_context = session_context(
            std::env::var("INTERVIEW_ID").ok(),
            std::env::var("CANDIDATE_ID").ok(),
        );
        config.opening_prompt = std::env::var("INTERVIEW_OPENING_PROMPT")
            .ok()
            .filter(|p| !p.trim().is_empty());
        config
    }
}

/// Assemble the handshake context from optional correlation ids.
pub fn session_context(
    interview_id: Option<String>,
    candidate_id: Option<String>,
) -> Option<serde_json::Value> {
    if interview_id.is_none() && candidate_id.is_none() {
        return None;
    }
    let mut ctx = json!({});
    if let Some(id) = interview_id {
        ctx["interview_id"] = json!(id);
    }
    if let Some(id) = candidate_id {
        ctx["candidate_id"] = json!(id);
    }
    Some(ctx)
}

/// Fixed parameters of the playback engine
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackConfig {
    pub sample_rate: u32,
    /// Samples per frame (7680 = 320 ms at 24 kHz)
    pub frame_samples: usize,
    pub initial_buffer: Duration,
    pub schedule_ahead: Duration,
    pub idle_poll: Duration,
    pub pre_wake_lead: Duration,
    pub stop_ramp: Duration,
    /// Delay after `stop()` before the output stage is replaced
    pub stage_rebuild_delay: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24_000,
            frame_samples: 7680,
            initial_buffer: Duration::from_millis(100),
            schedule_ahead: Duration::from_millis(200),
            idle_poll: Duration::from_millis(100),
            pre_wake_lead: Duration::from_millis(50),
            stop_ramp: Duration::from_millis(100),
            stage_rebuild_delay: Duration::from_millis(200),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_playback_defaults() {
        let config = PlaybackConfig::default();
        assert_eq!(config.sample_rate, 24_000);
        assert_eq!(config.frame_samples, 7680);
        assert_eq!(config.frame_samples as f64 / config.sample_rate as f64, 0.32);
        assert_eq!(config.initial_buffer, Duration::from_millis(100));
        assert_eq!(config.schedule_ahead, Duration::from_millis(200));
        assert_eq!(config.pre_wake_lead, Duration::from_millis(50));
    }

    #[test]
    fn test_session_context() {
        assert!(session_context(None, None).is_none());

        let ctx = session_context(Some("iv-1".into()), None).unwrap();
        assert_eq!(ctx["interview_id"], "iv-1");
        assert!(ctx.get("candidate_id").is_none());

        let ctx = session_context(Some("iv-1".into()), Some("c-9".into())).unwrap();
        assert_eq!(ctx["candidate_id"], "c-9");
    }

    #[test]
    fn test_live_defaults() {
        let config = LiveConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_millis(5000));
        assert_eq!(config.opening_delay, Duration::from_millis(1000));
        assert!(config.opening_prompt.is_none());
    }
}
