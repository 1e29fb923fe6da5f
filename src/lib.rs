//! Streaming recognition core for in-browser video captioning.
//!
//! Taps a tab's audio, normalizes and frames or chunks it
//! ([`audio_pipeline`]), streams it to a speech-recognition backend
//! ([`session_client`]), maps recognition-time coordinates onto the
//! video player's timeline ([`timeline_aligner`]), and, when a windowed
//! batch backend is in play, deduplicates and merges overlapping-window
//! transcripts ([`overlap_processor`]). [`credential_store`] persists the
//! backend API key confidentially at rest. [`session_manager`] wires
//! these together into one session; [`host`] is the trait boundary a
//! host implements over its concrete player, capture graph, and storage.

pub mod audio_pipeline;
pub mod config;
pub mod credential_store;
pub mod error;
pub mod host;
pub mod message;
pub mod overlap_processor;
pub mod session_client;
pub mod session_manager;
pub mod timeline_aligner;
