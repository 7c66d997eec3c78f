//! Plain data types shared across components. Mirrors the wire/data contracts of the external
//! interfaces rather than any single component's internals.

use serde::{Deserialize, Serialize};

/// A single ask-turn, submitted by [`crate::run_coordinator::RunCoordinator`] and consumed by
/// [`crate::ask_driver::AskDriver`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRequest {
    pub request_id: String,
    pub kind: TurnKind,
    pub stop_index: Option<i64>,
    pub question_text: String,
    #[serde(default)]
    pub guide: Option<GuideParams>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnKind {
    UserQuestion,
    TourStart,
    TourContinue,
    TourNext,
    TourPrev,
    TourJump,
    AskPrefetch,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuideParams {
    pub duration_s: Option<u32>,
    pub target_chars: Option<u32>,
    pub style: Option<String>,
    #[serde(default)]
    pub continuous: bool,
}

/// A sentence-sized unit pushed into the TTS pipeline. Exactly one of `text`,
/// `prefetched_wav_bytes`, or `recorded_audio_url` is populated.
#[derive(Debug, Clone)]
pub struct Segment {
    pub seq: u64,
    pub stop_index: Option<i64>,
    pub content: SegmentContent,
}

#[derive(Debug, Clone)]
pub enum SegmentContent {
    Text(String),
    PrefetchedWav(bytes::Bytes),
    RecordedAudioUrl(String),
}

impl Segment {
    pub fn text_key(&self) -> Option<&str> {
        match &self.content {
            SegmentContent::Text(t) => Some(t.as_str()),
            _ => None,
        }
    }
}

/// An item sitting in the audio queue of [`crate::tts_queue::TtsQueue`], already resolved to a
/// synthesis URL, raw bytes, or a recorded-audio URL.
#[derive(Debug, Clone)]
pub struct AudioItem {
    pub seq: u64,
    pub stop_index: Option<i64>,
    pub text: Option<String>,
    pub source: AudioSource,
}

#[derive(Debug, Clone)]
pub enum AudioSource {
    StreamUrl(String),
    Bytes(bytes::Bytes),
    RecordedUrl(String),
}

/// The per-turn envelope owning the text->audio pipeline. Invariant: at most one `TtsRun` is
/// "current" per [`crate::tts_queue::TtsQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TtsRunToken(pub u64);

/// A single waypoint of a guided tour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TourStop {
    pub stop_index: i64,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TourPlan {
    pub stops: Vec<TourStop>,
    pub stop_durations_s: Vec<u32>,
    pub stop_target_chars: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TourMode {
    Idle,
    Ready,
    Running,
    Interrupted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TourState {
    pub mode: TourMode,
    pub stop_index: i64,
    pub stop_name: Option<String>,
    pub last_answer_tail: Option<String>,
    pub last_action: Option<String>,
}

impl Default for TourState {
    fn default() -> Self {
        Self {
            mode: TourMode::Idle,
            stop_index: -1,
            stop_name: None,
            last_answer_tail: None,
            last_action: None,
        }
    }
}

/// Pre-fetched answer plus its segmentation, cached ahead of a continuous tour transition.
#[derive(Debug, Clone)]
pub struct PrefetchEntry {
    pub answer_text: String,
    pub tail: String,
    pub segments: Vec<Segment>,
    pub audio_segments: Vec<AudioItem>,
    pub created_at: std::time::Instant,
}

impl Default for PrefetchEntry {
    fn default() -> Self {
        Self {
            answer_text: String::new(),
            tail: String::new(),
            segments: Vec::new(),
            audio_segments: Vec::new(),
            created_at: std::time::Instant::now(),
        }
    }
}

/// Captured tail of a paused `TtsRun`, keyed by stop index, consumed at the subsequent continue.
#[derive(Debug, Clone, Default)]
pub struct ResumeEntry {
    pub text_segments: Vec<Segment>,
    pub audio_segments: Vec<AudioItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Normal,
    High,
}

/// A question waiting its turn in group mode.
#[derive(Debug, Clone)]
pub struct QueuedQuestion {
    pub request: TurnRequest,
    pub speaker: String,
    pub priority: Priority,
}
