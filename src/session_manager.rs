//! Session Manager — wires CS → AP → SC → TA → OP per the control flow in
//! the system overview. This is the orchestration layer a host embeds;
//! the components it drives remain independently testable.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::audio_pipeline::{PcmFramePipeline, TabAudioSource};
use crate::config::{CoreConfig, RecognitionBackend};
use crate::error::{CoreError, CoreResult, SessionError};
use crate::host::VideoClock;
use crate::message::{Segment, SessionState, Transcript};
use crate::overlap_processor::OverlapProcessor;
use crate::session_client::{Endpoint, SessionClient, SessionEvent};
use crate::timeline_aligner::{SeekAction, TimelineAligner};

/// Trailing-window fallback used when a final transcript carries no
/// word-level timing (§4.4 "Streaming case"). Chosen to roughly bound a
/// single spoken utterance; not configurable because it only matters for
/// backends that omit word timings, which the configuration table does
/// not otherwise describe.
const TRAILING_WINDOW_FALLBACK_SEC: f64 = 2.0;

/// Everything a host needs to render captions and react to session
/// lifecycle changes (§6 callbacks).
#[derive(Debug, Clone)]
pub enum CoreEvent {
    StateChanged(SessionState),
    Interim(Segment),
    Final(Segment),
    Error(String),
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Drives one captioning session end to end. Streaming sessions own a
/// [`SessionClient`] and forward [`crate::audio_pipeline`] frames into it;
/// batch sessions are fed externally, one chunk's transcript at a time,
/// via [`SessionManager::ingest_batch_transcript`] (batch HTTP transport
/// is provider-specific and lives on the host side, same as
/// [`TabAudioSource`]).
pub struct SessionManager {
    config: CoreConfig,
    aligner: Mutex<TimelineAligner>,
    overlap: Mutex<Option<OverlapProcessor>>,
    events_tx: mpsc::Sender<CoreEvent>,
    elapsed_ms: AtomicU64,
}

impl SessionManager {
    pub fn new(config: CoreConfig, clock: Arc<dyn VideoClock>, events_tx: mpsc::Sender<CoreEvent>) -> Self {
        let streaming = config.backend == RecognitionBackend::Streaming;
        let aligner = TimelineAligner::new(clock, config.segment_retention_sec, streaming);
        let overlap = if streaming {
            None
        } else {
            Some(OverlapProcessor::new(
                config.overlap_duration_ms,
                config.similarity_threshold,
                config.max_compare_length,
            ))
        };
        Self {
            config,
            aligner: Mutex::new(aligner),
            overlap: Mutex::new(overlap),
            events_tx,
            elapsed_ms: AtomicU64::new(0),
        }
    }

    /// Opens the streaming session, forwards `source`'s frames into it,
    /// and emits aligned [`CoreEvent`]s until the session closes (§2
    /// "Control flow").
    pub async fn run_streaming(
        self: Arc<Self>,
        endpoint: Endpoint,
        source: impl TabAudioSource + 'static,
    ) -> CoreResult<()> {
        let (frame_tx, mut frame_rx) = mpsc::channel(64);
        tokio::spawn(PcmFramePipeline::new().run(source, frame_tx));

        let (sc_events_tx, mut sc_events_rx) = mpsc::channel(64);
        let client = Arc::new(SessionClient::new(self.config.clone(), sc_events_tx));
        client.open(endpoint).await?;
        self.aligner.lock().await.on_session_connected().await;

        let forward_client = client.clone();
        let elapsed_for_forward = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                elapsed_for_forward
                    .elapsed_ms
                    .fetch_add(20, Ordering::Relaxed);
                if forward_client.send_frame(frame.payload).await.is_err() {
                    break;
                }
            }
        });

        while let Some(event) = sc_events_rx.recv().await {
            self.handle_session_event(event).await;
        }
        Ok(())
    }

    async fn handle_session_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::StateChanged(state) => {
                let _ = self.events_tx.send(CoreEvent::StateChanged(state)).await;
            }
            SessionEvent::Interim(transcript) => {
                if let Some(segment) = self.align_streaming_one(&transcript).await {
                    let _ = self.events_tx.send(CoreEvent::Interim(segment)).await;
                }
            }
            SessionEvent::Final(transcript) => {
                if let Some(segment) = self.align_streaming_one(&transcript).await {
                    let _ = self.events_tx.send(CoreEvent::Final(segment)).await;
                }
            }
            // Endpoint markers; no caption segment to emit.
            SessionEvent::SpeechStarted | SessionEvent::UtteranceEnd => {}
            SessionEvent::Error { message, .. } => {
                let _ = self.events_tx.send(CoreEvent::Error(message)).await;
            }
        }
    }

    async fn align_streaming_one(&self, transcript: &Transcript) -> Option<Segment> {
        let elapsed_sec = self.elapsed_ms.load(Ordering::Relaxed) as f64 / 1000.0;
        let mut aligner = self.aligner.lock().await;
        aligner
            .align_streaming(transcript, elapsed_sec, TRAILING_WINDOW_FALLBACK_SEC, now_ms())
            .into_iter()
            .next()
    }

    /// Feeds one batch chunk's recognition result through TA drift
    /// correction then OP dedup, emitting the surviving segments as final
    /// (§4.2 Mode B, §4.4 "Batch case", §4.5).
    pub async fn ingest_batch_transcript(
        &self,
        transcript: Transcript,
        chunk_start_sec: f64,
        chunk_duration_sec: f64,
    ) -> CoreResult<()> {
        let segments = {
            let mut aligner = self.aligner.lock().await;
            aligner
                .align_batch(&transcript, chunk_duration_sec, now_ms())
                .await
        };

        let mut overlap = self.overlap.lock().await;
        let deduped = match overlap.as_mut() {
            Some(op) => op.process(&segments, chunk_start_sec).map_err(CoreError::from)?,
            None => segments,
        };
        drop(overlap);

        for segment in deduped {
            let _ = self.events_tx.send(CoreEvent::Final(segment)).await;
        }
        Ok(())
    }

    /// Applies the seek policy; callers must close and reopen the
    /// streaming session when [`SeekAction::RestartSession`] is returned
    /// (§4.4 "Seek/pause policy").
    pub async fn on_seeked(&self) -> SeekAction {
        let mut overlap = self.overlap.lock().await;
        if let Some(op) = overlap.as_mut() {
            op.reset();
        }
        self.aligner.lock().await.on_seeked()
    }

    /// Surfaces a session error produced outside the SC reader task (e.g.
    /// CS verification failure before `open` is even attempted).
    pub async fn report_error(&self, error: CoreError) {
        let _ = self.events_tx.send(CoreEvent::Error(error.to_string())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::FixedClock;
    use crate::message::Word;

    fn transcript(words: Vec<Word>) -> Transcript {
        Transcript {
            text: words.iter().map(|w| w.text.clone()).collect::<Vec<_>>().join(" "),
            is_final: true,
            confidence: 0.9,
            words,
            recv_timestamp_ms: 0,
        }
    }

    #[tokio::test]
    async fn batch_ingest_emits_final_segment() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut config = CoreConfig::default();
        config.backend = RecognitionBackend::Batch;
        let manager = SessionManager::new(config, Arc::new(FixedClock(10.0)), tx);

        let t = transcript(vec![Word {
            text: "hello".into(),
            start_sec: 0.0,
            end_sec: 1.0,
        }]);
        manager.ingest_batch_transcript(t, 0.0, 3.0).await.unwrap();

        match rx.recv().await.unwrap() {
            CoreEvent::Final(seg) => assert_eq!(seg.text, "hello"),
            other => panic!("expected Final, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn seek_resets_overlap_state_for_batch_backend() {
        let (tx, _rx) = mpsc::channel(8);
        let mut config = CoreConfig::default();
        config.backend = RecognitionBackend::Batch;
        let manager = SessionManager::new(config, Arc::new(FixedClock(0.0)), tx);
        assert_eq!(manager.on_seeked().await, SeekAction::NoOp);
    }

    #[tokio::test]
    async fn seek_on_streaming_backend_requests_restart() {
        let (tx, _rx) = mpsc::channel(8);
        let config = CoreConfig::default(); // default backend is Streaming
        let manager = SessionManager::new(config, Arc::new(FixedClock(0.0)), tx);
        assert_eq!(manager.on_seeked().await, SeekAction::RestartSession);
    }

    #[tokio::test]
    async fn report_error_forwards_message() {
        let (tx, mut rx) = mpsc::channel(8);
        let manager = SessionManager::new(CoreConfig::default(), Arc::new(FixedClock(0.0)), tx);
        manager.report_error(CoreError::from(SessionError::Timeout)).await;
        match rx.recv().await.unwrap() {
            CoreEvent::Error(msg) => assert!(msg.contains("timed out")),
            other => panic!("expected Error, got {:?}", other),
        }
    }
}
