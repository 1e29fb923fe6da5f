//! Overlap Processor (OP) — §4.5. Batch-backend only.
//!
//! Deduplicates and merges transcripts from overlapping windows, using
//! time-overlap and text-similarity heuristics, then applies
//! language-aware sentence-merge rules.

use std::collections::HashSet;

use crate::error::{PipelineError, PipelineResult};
use crate::message::Segment;

/// Target language for [`merge_broken_sentences`]'s punctuation rules
/// (§4.5 "Sentence merging").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Chinese,
    English,
    Japanese,
    Korean,
    European,
    Auto,
}

/// Levenshtein edit distance (§8 invariant 5).
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let (n, m) = (a.len(), b.len());
    if n == 0 {
        return m;
    }
    if m == 0 {
        return n;
    }

    let mut prev: Vec<usize> = (0..=m).collect();
    let mut curr = vec![0usize; m + 1];

    for i in 1..=n {
        curr[0] = i;
        for j in 1..=m {
            let cost = if a[i - 1] == b[j - 1] { 0 } else { 1 };
            curr[j] = (prev[j] + 1)
                .min(curr[j - 1] + 1)
                .min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[m]
}

/// Strips punctuation and case-folds for comparison (§4.5 "normalize").
pub fn normalize(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_ascii_punctuation() && !is_cjk_punctuation(*c))
        .collect::<String>()
        .to_lowercase()
}

fn is_cjk_punctuation(c: char) -> bool {
    matches!(
        c,
        '、' | '。' | '！' | '？' | '；' | '：' | '，' | '「' | '」' | '『' | '』'
    )
}

/// Jaccard similarity over character sets, used as a cheap quick-reject
/// before the more expensive Levenshtein comparison (§4.5 step 4).
fn jaccard_char_similarity(a: &str, b: &str) -> f64 {
    let set_a: HashSet<char> = a.chars().collect();
    let set_b: HashSet<char> = b.chars().collect();
    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Text similarity on up to `max_len` characters of each normalized
/// string (§4.5 step 4, §8 invariant 4 symmetry/bounds).
pub fn text_similarity(a: &str, b: &str, max_len: usize) -> f64 {
    let na = normalize(a);
    let nb = normalize(b);
    if na == nb {
        return 1.0;
    }

    let longer = na.chars().count().max(nb.chars().count());
    let shorter = na.chars().count().min(nb.chars().count());
    if longer == 0 {
        return 1.0;
    }
    if shorter as f64 / longer as f64 < 0.5 {
        return 0.0;
    }

    let ta: String = na.chars().take(max_len).collect();
    let tb: String = nb.chars().take(max_len).collect();
    let dist = levenshtein(&ta, &tb);
    let denom = ta.chars().count().max(tb.chars().count()).max(1) as f64;
    (1.0 - dist as f64 / denom).clamp(0.0, 1.0)
}

fn time_overlap_seconds(a: (f64, f64), b: (f64, f64)) -> f64 {
    (a.1.min(b.1) - a.0.max(b.0)).max(0.0)
}

fn time_overlap_ratio(a: &Segment, b: &Segment) -> f64 {
    let overlap = time_overlap_seconds((a.start_sec, a.end_sec), (b.start_sec, b.end_sec));
    let len_a = a.end_sec - a.start_sec;
    let len_b = b.end_sec - b.start_sec;
    let min_len = len_a.min(len_b);
    if min_len <= 0.0 {
        0.0
    } else {
        overlap / min_len
    }
}

/// Retains prior-window state and produces deduplicated segments for the
/// current window (§4.5 "Per-call contract").
pub struct OverlapProcessor {
    overlap_duration_sec: f64,
    similarity_threshold: f64,
    max_compare_length: usize,
    previous: Option<Vec<Segment>>,
}

impl OverlapProcessor {
    pub fn new(overlap_duration_ms: u32, similarity_threshold: f64, max_compare_length: usize) -> Self {
        Self {
            overlap_duration_sec: overlap_duration_ms as f64 / 1000.0,
            similarity_threshold,
            max_compare_length,
            previous: None,
        }
    }

    /// `process(transcript_n, chunkStartSec_n) -> Segment[]` (§4.5).
    ///
    /// `segments` are chunk-relative (word/segment times measured from the
    /// start of the chunk); this shifts them to absolute time by
    /// `chunk_start_sec` before dedup.
    pub fn process(
        &mut self,
        segments: &[Segment],
        chunk_start_sec: f64,
    ) -> PipelineResult<Vec<Segment>> {
        if chunk_start_sec.is_nan() {
            return Err(PipelineError::InvalidInput("chunk_start_sec is NaN".to_string()));
        }

        let shifted: Vec<Segment> = segments
            .iter()
            .map(|s| {
                let mut s = s.clone();
                s.start_sec += chunk_start_sec;
                s.end_sec += chunk_start_sec;
                s
            })
            .collect();

        let Some(previous) = self.previous.take() else {
            self.previous = Some(shifted.clone());
            return Ok(shifted);
        };

        let overlap_window = (chunk_start_sec, chunk_start_sec + self.overlap_duration_sec);

        let in_window = |s: &Segment| {
            time_overlap_seconds((s.start_sec, s.end_sec), overlap_window) > 0.0
        };

        let p_overlap: Vec<&Segment> = previous.iter().filter(|s| in_window(s)).collect();

        let mut result = Vec::new();
        for c in &shifted {
            if !in_window(c) {
                result.push(c.clone());
                continue;
            }

            let mut is_duplicate = false;
            for p in &p_overlap {
                let quick = jaccard_char_similarity(&p.text, &c.text);
                if quick < 0.6 * self.similarity_threshold {
                    continue;
                }
                let overlap_ratio = time_overlap_ratio(p, c);
                let sim = text_similarity(&p.text, &c.text, self.max_compare_length);
                if overlap_ratio > 0.8 || (overlap_ratio > 0.5 && sim > self.similarity_threshold) {
                    is_duplicate = true;
                    break;
                }
            }
            if !is_duplicate {
                result.push(c.clone());
            }
        }

        self.previous = Some(shifted);
        Ok(result)
    }

    /// Clears retained state (§4.5 "Reset"); call on disable and on seek.
    pub fn reset(&mut self) {
        self.previous = None;
    }
}

/// Detects the dominant script in `text` by Unicode range, falling back
/// to English (§4.5 "Auto").
pub fn detect_language(text: &str) -> Language {
    let mut han = 0;
    let mut hiragana_katakana = 0;
    let mut hangul = 0;
    let mut total = 0;

    for c in text.chars() {
        if c.is_whitespace() {
            continue;
        }
        total += 1;
        let cp = c as u32;
        if (0x3040..=0x30FF).contains(&cp) {
            hiragana_katakana += 1;
        } else if (0xAC00..=0xD7A3).contains(&cp) {
            hangul += 1;
        } else if (0x4E00..=0x9FFF).contains(&cp) {
            han += 1;
        }
    }

    if total == 0 {
        return Language::English;
    }
    if hiragana_katakana > 0 {
        Language::Japanese
    } else if hangul > 0 {
        Language::Korean
    } else if han > 0 {
        Language::Chinese
    } else {
        Language::English
    }
}

const ENGLISH_ABBREVIATIONS: &[&str] = &[
    "mr", "mrs", "ms", "dr", "prof", "sr", "jr", "etc", "e.g", "i.e", "vs", "ph.d",
];

fn ends_with_any(text: &str, suffixes: &[char]) -> bool {
    text.trim_end()
        .chars()
        .last()
        .map(|c| suffixes.contains(&c))
        .unwrap_or(false)
}

fn last_token_is_abbreviation(text: &str) -> bool {
    let trimmed = text.trim_end().trim_end_matches('.');
    let last_word = trimmed.rsplit(|c: char| c.is_whitespace()).next().unwrap_or("");
    ENGLISH_ABBREVIATIONS.contains(&last_word.to_lowercase().as_str())
}

/// Whether `prev` and `next` should be concatenated into one sentence
/// (§4.5 "Sentence merging").
pub fn should_merge(prev: &Segment, next: &Segment, language: Language, gap_limit: f64) -> bool {
    if next.start_sec - prev.end_sec > gap_limit {
        return false;
    }

    let lang = match language {
        Language::Auto => detect_language(&format!("{}{}", prev.text, next.text)),
        other => other,
    };

    match lang {
        Language::Chinese => {
            if ends_with_any(&prev.text, &['。', '！', '？', '；', '：']) {
                return false;
            }
            ends_with_any(&prev.text, &['，', '、']) || prev.text.trim_end().ends_with('「')
        }
        Language::Japanese => {
            if ends_with_any(&prev.text, &['。', '！', '？']) {
                return false;
            }
            ends_with_any(&prev.text, &['、'])
        }
        Language::English => {
            if ends_with_any(&prev.text, &['!', '?', ';', ':']) {
                return false;
            }
            if ends_with_any(&prev.text, &[',']) {
                return true;
            }
            if prev.text.trim_end().ends_with('.') {
                return last_token_is_abbreviation(&prev.text);
            }
            true
        }
        Language::Korean | Language::European => {
            if ends_with_any(&prev.text, &['!', '?', ';', ':']) {
                return false;
            }
            if prev.text.trim_end().ends_with('.') {
                return last_token_is_abbreviation(&prev.text);
            }
            true
        }
        Language::Auto => unreachable!("Auto resolved above"),
    }
}

/// Walks adjacent segments, concatenating runs that pass
/// [`should_merge`], union-ing their time ranges (§4.5 "Sentence merging").
pub fn merge_broken_sentences(
    segments: Vec<Segment>,
    language: Language,
    gap_limit: f64,
) -> Vec<Segment> {
    let mut merged: Vec<Segment> = Vec::with_capacity(segments.len());
    for seg in segments {
        if let Some(last) = merged.last_mut() {
            if should_merge(last, &seg, language, gap_limit) {
                last.text = format!("{} {}", last.text, seg.text);
                last.end_sec = seg.end_sec;
                continue;
            }
        }
        merged.push(seg);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn seg(start: f64, end: f64, text: &str) -> Segment {
        Segment {
            start_sec: start,
            end_sec: end,
            text: text.to_string(),
            language: None,
            confidence: None,
            arrival_timestamp_ms: 0,
        }
    }

    #[test]
    fn levenshtein_self_is_zero() {
        assert_eq!(levenshtein("kitten", "kitten"), 0);
    }

    #[test]
    fn levenshtein_kitten_sitting_is_three() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
    }

    #[test]
    fn levenshtein_bounded_by_max_len() {
        let a = "abcdef";
        let b = "xyz";
        assert!(levenshtein(a, b) <= a.chars().count().max(b.chars().count()));
    }

    #[test]
    fn normalize_equal_strings_are_fully_similar() {
        let a = "Hello, World!";
        let b = "hello world";
        assert_eq!(normalize(a), normalize(b));
        assert_eq!(text_similarity(a, b, 100), 1.0);
    }

    #[test]
    fn text_similarity_is_symmetric_and_bounded() {
        let a = "the quick brown fox";
        let b = "the quick brown dog";
        let s1 = text_similarity(a, b, 100);
        let s2 = text_similarity(b, a, 100);
        assert_eq!(s1, s2);
        assert!((0.0..=1.0).contains(&s1));
    }

    #[test]
    fn first_chunk_returns_all_segments() {
        let mut op = OverlapProcessor::new(1000, 0.8, 100);
        let segs = vec![seg(0.0, 1.0, "hello"), seg(1.0, 2.0, "world")];
        let out = op.process(&segs, 0.0).unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn duplicate_overlap_segment_is_dropped() {
        let mut op = OverlapProcessor::new(1000, 0.8, 100);
        // window 0: [0,3), chunk 1 starts at 2.0 with 1s overlap [2,3)
        let chunk0 = vec![seg(0.0, 3.0, "今天天氣很好")];
        op.process(&chunk0, 0.0).unwrap();

        // chunk 1 (relative times before shift): overlap fragment "氣很好" duplicates
        // the tail of chunk 0; "我們去公園" is new.
        let chunk1 = vec![
            seg(0.0, 1.0, "氣很好"),
            seg(1.0, 3.0, "我們去公園"),
        ];
        let out = op.process(&chunk1, 2.0).unwrap();
        let texts: Vec<&str> = out.iter().map(|s| s.text.as_str()).collect();
        assert!(!texts.contains(&"氣很好"));
        assert!(texts.contains(&"我們去公園"));
    }

    #[test]
    fn process_is_idempotent_given_same_previous_state() {
        let mut op = OverlapProcessor::new(1000, 0.8, 100);
        let chunk0 = vec![seg(0.0, 3.0, "hello there friend")];
        op.process(&chunk0, 0.0).unwrap();

        let chunk1 = vec![seg(0.0, 3.0, "there friend you good")];
        let first = op.process(&chunk1, 2.0).unwrap();

        // Re-running process with the same previous-window state (restore it)
        // and the same current chunk must produce the same result.
        op.previous = Some(chunk0.clone());
        let second = op.process(&chunk1, 2.0).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn reset_clears_retained_state() {
        let mut op = OverlapProcessor::new(1000, 0.8, 100);
        op.process(&[seg(0.0, 1.0, "a")], 0.0).unwrap();
        op.reset();
        assert!(op.previous.is_none());
    }

    #[rstest]
    #[case("today,", true)]
    #[case("today.", false)]
    #[case("Dr.", true)]
    #[case("today!", false)]
    fn english_merge_rules(#[case] prev_text: &str, #[case] expect_merge: bool) {
        let prev = seg(0.0, 1.0, prev_text);
        let next = seg(1.1, 2.0, "tomorrow");
        assert_eq!(
            should_merge(&prev, &next, Language::English, 0.3),
            expect_merge
        );
    }

    #[test]
    fn chinese_merge_rules_respect_terminal_punctuation() {
        let prev = seg(0.0, 1.0, "今天天氣，");
        let next = seg(1.1, 2.0, "很好");
        assert!(should_merge(&prev, &next, Language::Chinese, 0.3));

        let prev2 = seg(0.0, 1.0, "今天天氣很好。");
        assert!(!should_merge(&prev2, &next, Language::Chinese, 0.3));
    }

    #[test]
    fn gap_exceeding_limit_never_merges() {
        let prev = seg(0.0, 1.0, "today,");
        let next = seg(2.0, 3.0, "tomorrow");
        assert!(!should_merge(&prev, &next, Language::English, 0.3));
    }

    #[test]
    fn detect_language_picks_script_by_unicode_range() {
        assert_eq!(detect_language("今天天氣很好"), Language::Chinese);
        assert_eq!(detect_language("こんにちは"), Language::Japanese);
        assert_eq!(detect_language("안녕하세요"), Language::Korean);
        assert_eq!(detect_language("hello world"), Language::English);
    }

    #[test]
    fn merge_broken_sentences_unions_time_ranges() {
        let segs = vec![
            seg(0.0, 1.0, "today,"),
            seg(1.1, 2.0, "tomorrow"),
            seg(2.1, 3.0, "we go."),
        ];
        let merged = merge_broken_sentences(segs, Language::English, 0.3);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].text, "today, tomorrow we go.");
        assert_eq!(merged[0].start_sec, 0.0);
        assert_eq!(merged[0].end_sec, 3.0);
    }
}
