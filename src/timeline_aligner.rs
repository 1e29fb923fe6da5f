//! Timeline Aligner (TA) — §4.4.
//!
//! Maps recognition-time coordinates onto the video player's timeline,
//! handling seek/pause and the batch-backend drift correction. TA keeps
//! only the session's anchor and a small ring of recent segments
//! (retention window, §3 "Ownership"); it never retains transcripts past
//! `segment_retention_sec`.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::host::VideoClock;
use crate::message::{Segment, Transcript};

/// Emitted when a seek forces the streaming session to restart with a
/// fresh anchor (§4.4 "Seek/pause policy").
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SeekAction {
    /// Streaming backend: caller must close the current session, wait
    /// ~200ms, then reopen with a fresh anchor.
    RestartSession,
    /// Batch backend: no state change needed; per-chunk correction
    /// re-anchors naturally.
    NoOp,
}

/// Streaming-case and batch-case alignment, with a bounded retention ring
/// for recently emitted segments.
pub struct TimelineAligner {
    clock: Arc<dyn VideoClock>,
    anchor_sec: Option<f64>,
    retention_sec: f64,
    recent: VecDeque<Segment>,
    streaming: bool,
}

impl TimelineAligner {
    pub fn new(clock: Arc<dyn VideoClock>, retention_sec: f64, streaming: bool) -> Self {
        Self {
            clock,
            anchor_sec: None,
            retention_sec,
            recent: VecDeque::new(),
            streaming,
        }
    }

    /// Records `anchor = videoCurrentTime()` the moment SC reaches
    /// Connected (§4.4 "Streaming case").
    pub async fn on_session_connected(&mut self) {
        self.anchor_sec = Some(self.clock.current_time_sec().await);
    }

    /// Streaming-case alignment: `anchor + wordStart`/`anchor + wordEnd`,
    /// falling back to a trailing window when no word-level times exist.
    pub fn align_streaming(
        &mut self,
        transcript: &Transcript,
        audio_elapsed_sec: f64,
        recent_window_sec: f64,
        now_ms: i64,
    ) -> Vec<Segment> {
        let anchor = self.anchor_sec.unwrap_or(0.0);
        let segments = if transcript.words.is_empty() {
            let end = anchor + audio_elapsed_sec;
            let start = end - recent_window_sec;
            vec![Segment {
                start_sec: start.max(anchor),
                end_sec: end,
                text: transcript.text.clone(),
                language: None,
                confidence: Some(transcript.confidence),
                arrival_timestamp_ms: now_ms,
            }]
        } else {
            vec![Segment {
                start_sec: anchor + transcript.words.first().unwrap().start_sec,
                end_sec: anchor + transcript.words.last().unwrap().end_sec,
                text: transcript.text.clone(),
                language: None,
                confidence: Some(transcript.confidence),
                arrival_timestamp_ms: now_ms,
            }]
        };
        self.retain(&segments);
        segments
    }

    /// Batch-case alignment: corrects for drift by re-querying
    /// `videoCurrentTime()` after each chunk's recognition completes
    /// (§4.4 "Batch case").
    pub async fn align_batch(
        &mut self,
        transcript: &Transcript,
        chunk_duration_sec: f64,
        now_ms: i64,
    ) -> Vec<Segment> {
        let current = self.clock.current_time_sec().await;
        let corrected_start = current - chunk_duration_sec;

        let segments: Vec<Segment> = if transcript.words.is_empty() {
            vec![Segment {
                start_sec: corrected_start,
                end_sec: current,
                text: transcript.text.clone(),
                language: None,
                confidence: Some(transcript.confidence),
                arrival_timestamp_ms: now_ms,
            }]
        } else {
            vec![Segment {
                start_sec: corrected_start + transcript.words.first().unwrap().start_sec,
                end_sec: corrected_start + transcript.words.last().unwrap().end_sec,
                text: transcript.text.clone(),
                language: None,
                confidence: Some(transcript.confidence),
                arrival_timestamp_ms: now_ms,
            }]
        };
        self.retain(&segments);
        segments
    }

    /// Applies the seek policy (§4.4 "Seek/pause policy").
    pub fn on_seeked(&mut self) -> SeekAction {
        if self.streaming {
            self.anchor_sec = None;
            self.recent.clear();
            SeekAction::RestartSession
        } else {
            SeekAction::NoOp
        }
    }

    /// Current anchor, if the session has reached Connected.
    pub fn anchor_sec(&self) -> Option<f64> {
        self.anchor_sec
    }

    fn retain(&mut self, segments: &[Segment]) {
        for s in segments {
            self.recent.push_back(s.clone());
        }
        if let Some(latest) = self.recent.back() {
            let cutoff = latest.end_sec - self.retention_sec;
            while let Some(front) = self.recent.front() {
                if front.end_sec < cutoff {
                    self.recent.pop_front();
                } else {
                    break;
                }
            }
        }
    }

    /// Segments retained within the configured window, oldest first.
    pub fn recent_segments(&self) -> impl Iterator<Item = &Segment> {
        self.recent.iter()
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
    async fn streaming_anchor_offsets_word_times() {
        let clock = Arc::new(FixedClock(10.0));
        let mut ta = TimelineAligner::new(clock, 30.0, true);
        ta.on_session_connected().await;
        let t = transcript(vec![Word {
            text: "hi".into(),
            start_sec: 1.0,
            end_sec: 2.0,
        }]);
        let segs = ta.align_streaming(&t, 2.0, 1.0, 0);
        assert_eq!(segs[0].start_sec, 11.0);
        assert_eq!(segs[0].end_sec, 12.0);
        assert!(segs[0].is_well_formed());
    }

    #[tokio::test]
    async fn streaming_without_word_times_uses_trailing_window() {
        let clock = Arc::new(FixedClock(0.0));
        let mut ta = TimelineAligner::new(clock, 30.0, true);
        ta.on_session_connected().await;
        let t = transcript(vec![]);
        let segs = ta.align_streaming(&t, 5.0, 2.0, 0);
        assert_eq!(segs[0].end_sec, 5.0);
        assert_eq!(segs[0].start_sec, 3.0);
    }

    #[tokio::test]
    async fn batch_case_corrects_for_seek_between_chunks() {
        let clock = Arc::new(FixedClock(60.0));
        let mut ta = TimelineAligner::new(clock, 30.0, false);
        let t = transcript(vec![Word {
            text: "hi".into(),
            start_sec: 0.5,
            end_sec: 1.0,
        }]);
        let segs = ta.align_batch(&t, 3.0, 0).await;
        // corrected_start = 60 - 3 = 57
        assert_eq!(segs[0].start_sec, 57.5);
        assert_eq!(segs[0].end_sec, 58.0);
    }

    #[tokio::test]
    async fn seek_on_streaming_backend_clears_anchor_and_requests_restart() {
        let clock = Arc::new(FixedClock(10.0));
        let mut ta = TimelineAligner::new(clock, 30.0, true);
        ta.on_session_connected().await;
        assert_eq!(ta.on_seeked(), SeekAction::RestartSession);
        assert!(ta.anchor_sec().is_none());
    }

    #[tokio::test]
    async fn seek_on_batch_backend_is_a_noop() {
        let clock = Arc::new(FixedClock(10.0));
        let mut ta = TimelineAligner::new(clock, 30.0, false);
        assert_eq!(ta.on_seeked(), SeekAction::NoOp);
    }

    #[tokio::test]
    async fn retention_window_drops_stale_segments() {
        let clock = Arc::new(FixedClock(0.0));
        let mut ta = TimelineAligner::new(clock, 5.0, true);
        ta.on_session_connected().await;
        for i in 0..5 {
            let t = transcript(vec![Word {
                text: "x".into(),
                start_sec: i as f64 * 3.0,
                end_sec: i as f64 * 3.0 + 1.0,
            }]);
            ta.align_streaming(&t, 0.0, 0.0, 0);
        }
        let oldest = ta.recent_segments().next().unwrap();
        let newest_end = ta.recent_segments().last().unwrap().end_sec;
        assert!(newest_end - oldest.end_sec <= 5.0 + 1.0);
    }
}
