//! One explicit configuration value constructed at session start.
//!
//! Replaces the "config dictionaries passed everywhere" pattern (design
//! notes §9): every component takes the fields it needs by name from a
//! single [`CoreConfig`] built once per session.

use serde::{Deserialize, Serialize};

/// Backend selected for recognition. Determines which of [`crate::audio_pipeline`]'s
/// two modes is active and whether [`crate::overlap_processor`] runs at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecognitionBackend {
    /// Full-duplex streaming session (§4.3): PCM frames over a persistent
    /// websocket, interim + final transcripts.
    Streaming,
    /// Windowed batch HTTP backend (§4.2 Mode B, §4.5): overlapping
    /// compressed chunks, deduplicated after the fact.
    Batch,
}

/// Whether the recognition service accepts text control frames on the
/// audio channel. Some deployments reject any text frame as a schema
/// error (§4.3, §9 Open Question).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeepAliveMode {
    /// Send `{"type":"KeepAlive"}` every `keep_alive_interval_ms` while
    /// frames are paused.
    TextPing,
    /// No text frames permitted; caller must close the session when audio
    /// has been silent for more than 10s.
    Disabled,
}

/// Full configuration for one recognition session (§6 configuration table).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreConfig {
    /// Backend model identifier (default `nova-2`).
    pub model: String,
    /// BCP-47 language code, or `"multi"` for auto-detect.
    pub language: String,
    /// Emit interim transcripts.
    pub interim_results: bool,
    /// Silence duration (ms) the backend uses to finalize an utterance.
    pub endpointing_ms: u32,
    /// Batch-mode window overlap, milliseconds.
    pub overlap_duration_ms: u32,
    /// Batch-mode window length, milliseconds.
    pub window_duration_ms: u32,
    /// OP dedup similarity threshold, in `[0,1]`.
    pub similarity_threshold: f64,
    /// Max gap (seconds) allowed for OP sentence merge.
    pub merge_time_gap_sec: f64,
    /// Max characters used by the OP text-similarity comparison.
    pub max_compare_length: usize,
    /// SC keep-alive cadence, milliseconds.
    pub keep_alive_interval_ms: u64,
    /// How the SC keep-alive text frame is handled by the backend.
    pub keep_alive_mode: KeepAliveMode,
    /// Close the session if audio has been silent this long with keep-alive disabled.
    pub silence_close_ms: u64,
    /// SC reconnection attempt cap.
    pub reconnect_max_retries: u32,
    /// SC linear backoff base delay, milliseconds.
    pub reconnect_base_delay_ms: u64,
    /// Renderer-side (and TA) segment retention window, seconds.
    pub segment_retention_sec: f64,
    /// Which backend (streaming vs batch) is active for this session.
    pub backend: RecognitionBackend,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            model: "nova-2".to_string(),
            language: "zh-TW".to_string(),
            interim_results: true,
            endpointing_ms: 300,
            overlap_duration_ms: 1000,
            window_duration_ms: 3000,
            similarity_threshold: 0.8,
            merge_time_gap_sec: 0.3,
            max_compare_length: 100,
            keep_alive_interval_ms: 5000,
            keep_alive_mode: KeepAliveMode::TextPing,
            silence_close_ms: 10_000,
            reconnect_max_retries: 5,
            reconnect_base_delay_ms: 1000,
            segment_retention_sec: 30.0,
            backend: RecognitionBackend::Streaming,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_configuration_table() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.model, "nova-2");
        assert_eq!(cfg.language, "zh-TW");
        assert!(cfg.interim_results);
        assert_eq!(cfg.endpointing_ms, 300);
        assert_eq!(cfg.overlap_duration_ms, 1000);
        assert_eq!(cfg.similarity_threshold, 0.8);
        assert_eq!(cfg.merge_time_gap_sec, 0.3);
        assert_eq!(cfg.max_compare_length, 100);
        assert_eq!(cfg.keep_alive_interval_ms, 5000);
        assert_eq!(cfg.reconnect_max_retries, 5);
        assert_eq!(cfg.reconnect_base_delay_ms, 1000);
        assert_eq!(cfg.segment_retention_sec, 30.0);
    }
}
