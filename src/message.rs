//! Wire and data-model types shared across components (§3, §6).

use serde::{Deserialize, Serialize};

/// 16 kHz mono PCM frame, 20ms worth of samples (§3 AudioFrame).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// Monotonically increasing index, strictly ordered (§5 Ordering).
    pub index: u64,
    /// Number of samples in `payload` (≈320 for a 20ms frame at 16kHz).
    pub sample_count: usize,
    /// Sample rate in Hz. Always 16000 for frames leaving the pipeline.
    pub sample_rate: u32,
    /// Signed 16-bit little-endian PCM, mono. `payload.len() == sample_count * 2`.
    pub payload: Vec<u8>,
}

impl AudioFrame {
    /// Samples per 20ms frame at 16kHz (§3, §6).
    pub const SAMPLES_PER_FRAME: usize = 320;
    /// Bytes per 20ms frame (`SAMPLES_PER_FRAME * 2`).
    pub const BYTES_PER_FRAME: usize = Self::SAMPLES_PER_FRAME * 2;

    /// Builds a frame from signed 16-bit samples, validating the invariant
    /// `payload.len() == sample_count * 2`.
    pub fn from_samples(index: u64, samples: &[i16]) -> Self {
        let mut payload = Vec::with_capacity(samples.len() * 2);
        for s in samples {
            payload.extend_from_slice(&s.to_le_bytes());
        }
        Self {
            index,
            sample_count: samples.len(),
            sample_rate: 16_000,
            payload,
        }
    }
}

/// Compressed, container-wrapped audio window for the batch backend (§3 AudioChunk, §4.2 Mode B).
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Monotonically increasing window index.
    pub index: u64,
    /// Absolute offset of the window start, relative to session start.
    pub start_offset_sec: f64,
    /// Absolute offset of the window end, relative to session start.
    pub end_offset_sec: f64,
    /// Container MIME type, consistent with the (possibly repaired) header.
    pub container_mime: String,
    /// Raw container bytes.
    pub bytes: Vec<u8>,
}

/// Cross-context-safe serializable form of an [`AudioChunk`] (§4.2, §9
/// "Cross-context transfer of bytes"): base64 payload plus metadata, never
/// an opaque platform blob handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioChunkEnvelope {
    pub index: u64,
    pub start_offset_sec: f64,
    pub end_offset_sec: f64,
    pub mime_type: String,
    pub byte_length: usize,
    /// Base64-encoded container bytes.
    pub data_base64: String,
}

impl AudioChunkEnvelope {
    pub fn from_chunk(chunk: &AudioChunk) -> Self {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;
        Self {
            index: chunk.index,
            start_offset_sec: chunk.start_offset_sec,
            end_offset_sec: chunk.end_offset_sec,
            mime_type: chunk.container_mime.clone(),
            byte_length: chunk.bytes.len(),
            data_base64: STANDARD.encode(&chunk.bytes),
        }
    }

    pub fn into_chunk(self) -> Result<AudioChunk, base64::DecodeError> {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;
        let bytes = STANDARD.decode(self.data_base64.as_bytes())?;
        Ok(AudioChunk {
            index: self.index,
            start_offset_sec: self.start_offset_sec,
            end_offset_sec: self.end_offset_sec,
            container_mime: self.mime_type,
            bytes,
        })
    }
}

/// One recognized word with relative timing (§3 Transcript.words).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Word {
    pub text: String,
    pub start_sec: f64,
    pub end_sec: f64,
}

/// A transcript emitted by the Session Client (§3 Transcript).
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub text: String,
    pub is_final: bool,
    pub confidence: f64,
    pub words: Vec<Word>,
    /// Wall-clock time the message was received, epoch milliseconds.
    pub recv_timestamp_ms: i64,
}

/// A caption-ready, video-time-stamped segment (§3 Segment).
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub start_sec: f64,
    pub end_sec: f64,
    pub text: String,
    pub language: Option<String>,
    pub confidence: Option<f64>,
    /// Wall-clock arrival time, epoch milliseconds — lets the renderer apply
    /// the stale-arrival compensation policy described in §4.4.
    pub arrival_timestamp_ms: i64,
}

impl Segment {
    /// §8 invariant 1: `start <= end`.
    pub fn is_well_formed(&self) -> bool {
        self.start_sec <= self.end_sec
    }
}

/// Session lifecycle state (§3 Data Model, §4.3 state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Errored,
}

/// Recognition-service word payload, wire format (§6).
#[derive(Debug, Deserialize)]
pub struct WireWord {
    pub word: String,
    pub start: f64,
    pub end: f64,
}

#[derive(Debug, Deserialize)]
pub struct WireAlternative {
    pub transcript: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub words: Vec<WireWord>,
}

#[derive(Debug, Deserialize)]
pub struct WireChannel {
    pub alternatives: Vec<WireAlternative>,
}

/// Server→client messages tolerated by the Session Client (§4.3, §6).
///
/// Unknown `type` values deserialize to [`WireMessage::Unknown`] rather than
/// failing, matching "unknown kinds are logged and ignored."
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessage {
    Results {
        channel: WireChannel,
        is_final: bool,
    },
    Metadata,
    SpeechStarted,
    UtteranceEnd,
    Error {
        #[serde(default)]
        message: String,
    },
    #[serde(other)]
    Unknown,
}

/// Client→server keep-alive text frame (§4.3, §6).
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum ClientControlMessage {
    KeepAlive,
}
