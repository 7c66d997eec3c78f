//! TourPipeline (C4): prompt building, continuous-tour driving, bounded next-stop prefetch.
//!
//! The single in-flight prefetch request guarded by a cancellation handle follows the same
//! "one handle, identified and cancel-then-replace" shape as `RvcCoordinator::rvc_request`
//! (`st_system/src/rvc_backends/mod.rs`), substituting a `CancellationToken` for its
//! process handle.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::data::{AudioSource, PrefetchEntry, TourPlan};
use crate::epoch::InterruptEpoch;
use crate::tts_queue::TtsQueueHandle;

/// Phrases that must be stripped from a compressed tail before it's fed back as continuity
/// context, matching the distilled spec's "forbid preview/welcome phrasing" contract.
const TRANSITION_PHRASES: &[&str] = &["接下来", "下一站", "欢迎来到"];
const MAX_TAIL_CHARS: usize = 80;

pub struct TourPipelineState {
    active: bool,
    current_stop_index: i64,
    cache: HashMap<i64, PrefetchEntry>,
    prefetch_token: Option<CancellationToken>,
}

impl Default for TourPipelineState {
    fn default() -> Self {
        Self {
            active: false,
            current_stop_index: -1,
            cache: HashMap::new(),
            prefetch_token: None,
        }
    }
}

pub struct TourPipeline {
    state: Mutex<TourPipelineState>,
    epoch: InterruptEpoch,
    max_prefetch_ahead: i64,
}

impl TourPipeline {
    pub fn new(epoch: InterruptEpoch, max_prefetch_ahead: i64) -> Self {
        Self {
            state: Mutex::new(TourPipelineState::default()),
            epoch,
            max_prefetch_ahead,
        }
    }

    pub async fn current_stop_index(&self) -> i64 {
        self.state.lock().await.current_stop_index
    }

    pub async fn set_current_stop_index(&self, idx: i64) {
        self.state.lock().await.current_stop_index = idx;
    }

    pub async fn cached_entry(&self, stop_index: i64) -> Option<PrefetchEntry> {
        self.state.lock().await.cache.get(&stop_index).cloned()
    }

    /// Cancel any in-flight prefetch and mark the pipeline inactive. The cache is preserved (soft
    /// stop, e.g. a manual pause).
    pub async fn pause(&self, reason: &str) {
        tracing::debug!(reason, "tour pipeline paused");
        let mut state = self.state.lock().await;
        state.active = false;
        if let Some(token) = state.prefetch_token.take() {
            token.cancel();
        }
    }

    /// Cancel any in-flight prefetch, clear the cache, and reset the stop index (hard stop, e.g.
    /// a user interrupt).
    pub async fn interrupt(&self, reason: &str) {
        tracing::debug!(reason, "tour pipeline interrupted");
        let mut state = self.state.lock().await;
        state.active = false;
        state.current_stop_index = -1;
        state.cache.clear();
        if let Some(token) = state.prefetch_token.take() {
            token.cancel();
        }
    }

    pub async fn set_active(&self, active: bool) {
        self.state.lock().await.active = active;
    }

    /// `startContinuousTour({start_index, first_action})`: arms the pipeline for a continuous
    /// tour anchored at `start_index`. The caller still issues the AskDriver call for
    /// `start_index` itself; from here on the driver's done-handler chains prefetches by calling
    /// `maybe_prefetch_next_stop` through [`Self::set_current_stop_index`].
    pub async fn start_continuous_tour(&self, start_index: i64) {
        let mut state = self.state.lock().await;
        state.active = true;
        state.current_stop_index = start_index;
    }

    /// Replay: re-enqueue `stop_index`'s cached text segments (in original seq order) into
    /// `tts_queue`, consuming the cache entry so a later call can't double-play it. Returns
    /// `false` on a cache miss, leaving the caller to fall back to a fresh AskDriver call.
    pub async fn replay_prefetch_to_queue(&self, stop_index: i64, tts_queue: &TtsQueueHandle) -> bool {
        let entry = self.state.lock().await.cache.remove(&stop_index);
        let Some(entry) = entry else { return false };
        for segment in &entry.segments {
            if let Some(text) = segment.text_key() {
                tts_queue.enqueue_text(text.to_string(), segment.stop_index).await;
            }
        }
        tts_queue.mark_rag_done().await;
        true
    }

    /// Replay variant for recorded-tour playback: re-enqueues `stop_index`'s cached audio
    /// segments instead of its text segments.
    pub async fn replay_prefetch_audio_to_queue(&self, stop_index: i64, tts_queue: &TtsQueueHandle) -> bool {
        let entry = self.state.lock().await.cache.remove(&stop_index);
        let Some(entry) = entry else { return false };
        for audio in &entry.audio_segments {
            match &audio.source {
                AudioSource::RecordedUrl(url) => {
                    tts_queue.enqueue_audio_url(url.clone(), audio.stop_index, audio.text.clone()).await;
                }
                AudioSource::StreamUrl(_) => {
                    if let Some(text) = &audio.text {
                        tts_queue.enqueue_text(text.clone(), audio.stop_index).await;
                    }
                }
                AudioSource::Bytes(bytes) => {
                    tts_queue.enqueue_wav_bytes(bytes.clone(), audio.stop_index, audio.text.clone()).await;
                }
            }
        }
        tts_queue.mark_rag_done().await;
        true
    }

    /// Kick off (or chain) a prefetch for `stop_index`, cancelling any prior in-flight prefetch.
    /// `fetch` performs the actual network call and returns the resolved entry.
    pub async fn maybe_prefetch_next_stop<F, Fut>(&self, stop_index: i64, total_stops: Option<i64>, fetch: F)
    where
        F: FnOnce(i64) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Option<PrefetchEntry>> + Send + 'static,
    {
        let target = stop_index + 1;
        if let Some(total) = total_stops {
            if target >= total {
                return;
            }
        }

        let captured_epoch = self.epoch.snapshot();
        let (already_cached, within_window) = {
            let mut state = self.state.lock().await;
            if !state.active {
                return;
            }
            // Window is anchored on the stop actually believed to be playing
            // (`current_stop_index`, maintained by TourController), never on the `stop_index`
            // argument alone — a stale/out-of-order call must not widen the window.
            let within = target <= state.current_stop_index + self.max_prefetch_ahead;
            let cached = state.cache.contains_key(&target);
            if !cached && within {
                if let Some(prev) = state.prefetch_token.take() {
                    prev.cancel();
                }
                let token = CancellationToken::new();
                state.prefetch_token = Some(token.clone());
            }
            (cached, within)
        };

        if already_cached || !within_window {
            return;
        }

        let epoch = self.epoch.clone();
        let entry = fetch(target).await;
        if !epoch.is_current(captured_epoch) {
            return;
        }
        if let Some(entry) = entry {
            let mut state = self.state.lock().await;
            state.cache.insert(target, entry);
        }
    }

    /// Build the prompt for a tour-stop turn, following the continuity rules in §4.4.
    pub fn build_prompt(&self, action: TourPromptAction, stop_index: i64, stop_name: &str, total_stops: Option<usize>, plan: Option<&TourPlan>, guide_duration_s: Option<u32>, audience_profile: Option<&str>, previous_tail: Option<&str>) -> String {
        let mut prompt = String::new();
        let ordinal = stop_index + 1;
        match total_stops {
            Some(total) => prompt.push_str(&format!("第{ordinal}站「{stop_name}」（共{total}站）")),
            None => prompt.push_str(&format!("第{ordinal}站「{stop_name}」")),
        }

        let (duration_hint, target_chars_hint) = plan
            .map(|p| {
                let idx = stop_index.max(0) as usize;
                (p.stop_durations_s.get(idx).copied(), p.stop_target_chars.get(idx).copied())
            })
            .unwrap_or((None, None));
        let duration = duration_hint.or(guide_duration_s);
        if let Some(duration) = duration {
            prompt.push_str(&format!("\n讲解时长约{duration}秒。"));
        }
        if let Some(target) = target_chars_hint {
            prompt.push_str(&format!("\n目标字数约{target}字。"));
        }
        if let Some(profile) = audience_profile {
            prompt.push_str(&format!("\n听众：{profile}。"));
        }

        if matches!(action, TourPromptAction::Continue | TourPromptAction::Next) {
            if let Some(tail) = previous_tail {
                let compressed = compress_tail(tail);
                prompt.push_str(&format!(
                    "\n延续上一段讲解的语气，不要再次欢迎或预告下一站。上一段结尾：{compressed}"
                ));
            }
        }

        prompt
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TourPromptAction {
    Start,
    Continue,
    Next,
}

/// Strip transition phrases and clamp to the max tail length (§4.4).
fn compress_tail(tail: &str) -> String {
    let mut cleaned = tail.to_string();
    for phrase in TRANSITION_PHRASES {
        cleaned = cleaned.replace(phrase, "");
    }
    let cleaned = cleaned.trim();
    if cleaned.chars().count() > MAX_TAIL_CHARS {
        cleaned.chars().take(MAX_TAIL_CHARS).collect()
    } else {
        cleaned.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Segment, SegmentContent};

    fn pipeline() -> TourPipeline {
        TourPipeline::new(InterruptEpoch::new(), 1)
    }

    #[test]
    fn compress_tail_strips_transition_phrases() {
        let out = compress_tail("接下来我们去下一站，欢迎来到花园");
        assert!(!out.contains("接下来"));
        assert!(!out.contains("下一站"));
        assert!(!out.contains("欢迎来到"));
    }

    #[test]
    fn compress_tail_clamps_to_max_length() {
        let long: String = std::iter::repeat('字').take(200).collect();
        let out = compress_tail(&long);
        assert!(out.chars().count() <= MAX_TAIL_CHARS);
    }

    #[tokio::test]
    async fn at_most_one_prefetch_is_cached_per_target_stop() {
        let pipeline = pipeline();
        pipeline.set_active(true).await;
        pipeline.set_current_stop_index(0).await;
        pipeline.maybe_prefetch_next_stop(0, Some(5), |idx| async move {
            Some(PrefetchEntry {
                answer_text: format!("answer {idx}"),
                ..Default::default()
            })
        }).await;

        assert!(pipeline.cached_entry(1).await.is_some());
    }

    #[tokio::test]
    async fn prefetch_outside_window_is_skipped() {
        let pipeline = pipeline();
        pipeline.set_active(true).await;
        pipeline.set_current_stop_index(0).await;
        // max_prefetch_ahead=1, so stop 5 -> target 6 is far outside the window from stop 0.
        pipeline.maybe_prefetch_next_stop(5, Some(10), |idx| async move {
            Some(PrefetchEntry {
                answer_text: format!("answer {idx}"),
                ..Default::default()
            })
        }).await;

        assert!(pipeline.cached_entry(6).await.is_none());
    }

    #[tokio::test]
    async fn interrupt_clears_cache_and_resets_stop_index() {
        let pipeline = pipeline();
        pipeline.set_active(true).await;
        pipeline.set_current_stop_index(0).await;
        pipeline.maybe_prefetch_next_stop(0, Some(5), |idx| async move {
            Some(PrefetchEntry {
                answer_text: format!("answer {idx}"),
                ..Default::default()
            })
        }).await;
        assert!(pipeline.cached_entry(1).await.is_some());

        pipeline.interrupt("user_stop").await;
        assert!(pipeline.cached_entry(1).await.is_none());
        assert_eq!(pipeline.current_stop_index().await, -1);
    }

    fn tts_queue_handle() -> TtsQueueHandle {
        use crate::audio::AudioOutputHandle;
        use crate::events::EventSink;
        use std::sync::Arc;

        let audio = AudioOutputHandle::new(16_000);
        let http = reqwest::Client::new();
        let events = EventSink::new(http.clone(), url::Url::parse("http://localhost:1").unwrap(), "client".into());
        let builder: crate::tts_queue::UrlBuilder = Arc::new(|text, ctx| format!("http://localhost/tts?text={text}&seq={}", ctx.segment_index));
        TtsQueueHandle::new("client".into(), 2, http, audio, events, builder)
    }

    #[tokio::test]
    async fn start_continuous_tour_arms_active_and_anchors_stop_index() {
        let pipeline = pipeline();
        pipeline.start_continuous_tour(2).await;
        assert_eq!(pipeline.current_stop_index().await, 2);
        pipeline
            .maybe_prefetch_next_stop(2, Some(5), |idx| async move {
                Some(PrefetchEntry {
                    answer_text: format!("answer {idx}"),
                    ..Default::default()
                })
            })
            .await;
        assert!(pipeline.cached_entry(3).await.is_some());
    }

    #[tokio::test]
    async fn replay_prefetch_to_queue_consumes_the_cache_entry_once() {
        let pipeline = pipeline();
        pipeline.set_active(true).await;
        pipeline.set_current_stop_index(0).await;
        pipeline
            .maybe_prefetch_next_stop(0, Some(5), |idx| async move {
                Some(PrefetchEntry {
                    answer_text: format!("answer {idx}"),
                    segments: vec![Segment {
                        seq: 0,
                        stop_index: Some(idx),
                        content: SegmentContent::Text(format!("hello from {idx}")),
                    }],
                    ..Default::default()
                })
            })
            .await;

        let tts_queue = tts_queue_handle();
        let replayed = pipeline.replay_prefetch_to_queue(1, &tts_queue).await;
        assert!(replayed);
        assert!(pipeline.cached_entry(1).await.is_none());

        let replayed_again = pipeline.replay_prefetch_to_queue(1, &tts_queue).await;
        assert!(!replayed_again);
    }
}
