//! TourController (C6): start/pause/continue/next/prev/jump/reset commands, resume-buffer
//! capture, audio-context reconciliation.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::data::{AudioItem, ResumeEntry, Segment, TourMode, TourState};
use crate::epoch::InterruptEpoch;
use crate::tour_pipeline::TourPipeline;
use crate::tts_queue::TtsQueueHandle;

const QUESTION_RESUME_SLOT: i64 = i64::MIN;

pub struct TourController {
    state: Mutex<TourState>,
    resume_buffer: Mutex<HashMap<i64, ResumeEntry>>,
    epoch: InterruptEpoch,
    pipeline: Arc<TourPipeline>,
    tts_queue: TtsQueueHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TourCommand {
    Start,
    Continue,
    Pause,
    Prev,
    Next,
    JumpTo(i64),
    Reset,
}

impl TourController {
    pub fn new(epoch: InterruptEpoch, pipeline: Arc<TourPipeline>, tts_queue: TtsQueueHandle) -> Self {
        Self {
            state: Mutex::new(TourState::default()),
            resume_buffer: Mutex::new(HashMap::new()),
            epoch,
            pipeline,
            tts_queue,
        }
    }

    pub async fn snapshot(&self) -> TourState {
        self.state.lock().await.clone()
    }

    /// Returns the new stop index the caller should now ask about, or `None` when the command
    /// was `pause`/`reset`/a no-op `continue` that found nothing to resume and needs a fresh
    /// prompt for the CURRENT stop.
    pub async fn apply(&self, command: TourCommand, stop_count: i64) -> TourControllerOutcome {
        match command {
            TourCommand::Start => self.interrupt_and_jump(0).await,
            TourCommand::Next => {
                let current = self.state.lock().await.stop_index;
                let target = (current + 1).min(stop_count.saturating_sub(1).max(0));
                self.interrupt_and_jump(target).await
            }
            TourCommand::Prev => {
                let current = self.state.lock().await.stop_index;
                let target = (current - 1).max(0);
                self.interrupt_and_jump(target).await
            }
            TourCommand::JumpTo(idx) => self.interrupt_and_jump(idx.clamp(0, stop_count.saturating_sub(1).max(0))).await,
            TourCommand::Pause => {
                self.capture_resume_buffer().await;
                self.pipeline.pause("user_pause").await;
                let mut state = self.state.lock().await;
                state.mode = TourMode::Interrupted;
                state.last_action = Some("pause".to_string());
                TourControllerOutcome::Paused
            }
            TourCommand::Reset => {
                self.epoch.bump("tour_reset");
                self.pipeline.interrupt("reset").await;
                self.resume_buffer.lock().await.clear();
                let mut state = self.state.lock().await;
                *state = TourState::default();
                TourControllerOutcome::Reset
            }
            TourCommand::Continue => self.continue_from_resume().await,
        }
    }

    async fn interrupt_and_jump(&self, target_stop: i64) -> TourControllerOutcome {
        self.epoch.bump("tour_navigate");
        self.resume_buffer.lock().await.clear();
        self.pipeline.interrupt("tour_navigate").await;

        let mut state = self.state.lock().await;
        state.mode = TourMode::Running;
        state.stop_index = target_stop;
        state.last_action = Some("navigate".to_string());
        TourControllerOutcome::FreshAsk { stop_index: target_stop }
    }

    async fn capture_resume_buffer(&self) {
        let stop_index = self.state.lock().await.stop_index;
        let text_segments = self.tts_queue.capture_pending_text_by_stop_index(stop_index).await;
        let audio_segments = self.tts_queue.capture_pending_audio_by_stop_index(stop_index).await;
        if !text_segments.is_empty() || !audio_segments.is_empty() {
            self.resume_buffer.lock().await.insert(
                stop_index,
                ResumeEntry {
                    text_segments,
                    audio_segments,
                },
            );
        }
    }

    /// Resume algorithm, §4.6: question slot first, then tour-stop resume; the slot is consumed
    /// immediately so a second `continue` cannot replay the same audio.
    async fn continue_from_resume(&self) -> TourControllerOutcome {
        let question_entry = self.resume_buffer.lock().await.remove(&QUESTION_RESUME_SLOT);
        if let Some(entry) = question_entry {
            self.replay_entry(&entry).await;
            let mut state = self.state.lock().await;
            state.mode = TourMode::Running;
            return TourControllerOutcome::Resumed;
        }

        let stop_index = self.state.lock().await.stop_index;
        let entry = self.resume_buffer.lock().await.remove(&stop_index);
        match entry {
            Some(entry) => {
                self.replay_entry(&entry).await;
                let mut state = self.state.lock().await;
                state.mode = TourMode::Running;
                TourControllerOutcome::TourStopResumed { stop_index }
            }
            None => {
                let mut state = self.state.lock().await;
                state.mode = TourMode::Running;
                TourControllerOutcome::FreshAsk { stop_index }
            }
        }
    }

    async fn replay_entry(&self, entry: &ResumeEntry) {
        for audio in &entry.audio_segments {
            match &audio.source {
                crate::data::AudioSource::RecordedUrl(url) => {
                    self.tts_queue.enqueue_audio_url(url.clone(), audio.stop_index, audio.text.clone()).await;
                }
                // A synthesized segment's stream URL is tied to the run that generated it and is
                // not safe to re-fetch; replay it as text so it's resynthesized under the new run.
                crate::data::AudioSource::StreamUrl(_) => {
                    if let Some(text) = &audio.text {
                        self.tts_queue.enqueue_text(text.clone(), audio.stop_index).await;
                    }
                }
                crate::data::AudioSource::Bytes(bytes) => {
                    self.tts_queue.enqueue_wav_bytes(bytes.clone(), audio.stop_index, audio.text.clone()).await;
                }
            }
        }
        for segment in &entry.text_segments {
            if let Some(text) = segment.text_key() {
                self.tts_queue.enqueue_text(text.to_string(), segment.stop_index).await;
            }
        }
    }

    /// Capture the resume buffer for a manually-paused user question (not a tour stop).
    pub async fn capture_question_resume(&self, text_segments: Vec<Segment>, audio_segments: Vec<AudioItem>) {
        self.resume_buffer.lock().await.insert(
            QUESTION_RESUME_SLOT,
            ResumeEntry {
                text_segments,
                audio_segments,
            },
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TourControllerOutcome {
    FreshAsk { stop_index: i64 },
    /// A paused user question's audio was replayed from the question resume slot.
    Resumed,
    /// A paused tour stop's audio was replayed. §4.6 step 4: the caller should schedule a
    /// next-stop prefetch here when continuous mode is on.
    TourStopResumed { stop_index: i64 },
    Paused,
    Reset,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioOutputHandle;
    use crate::events::EventSink;
    use std::sync::Arc;

    fn controller() -> TourController {
        let epoch = InterruptEpoch::new();
        let pipeline = Arc::new(TourPipeline::new(epoch.clone(), 1));
        let audio = AudioOutputHandle::new(16_000);
        let http = reqwest::Client::new();
        let events = EventSink::new(http.clone(), url::Url::parse("http://localhost:1").unwrap(), "client".into());
        let builder: crate::tts_queue::UrlBuilder = Arc::new(|text, ctx| format!("http://localhost/tts?text={text}&seq={}", ctx.segment_index));
        let queue = TtsQueueHandle::new("client".into(), 2, http, audio, events, builder);
        TourController::new(epoch, pipeline, queue)
    }

    #[tokio::test]
    async fn next_clamps_at_last_stop() {
        let controller = controller();
        controller.apply(TourCommand::JumpTo(2), 3).await;
        let outcome = controller.apply(TourCommand::Next, 3).await;
        assert_eq!(outcome, TourControllerOutcome::FreshAsk { stop_index: 2 });
    }

    #[tokio::test]
    async fn prev_does_not_go_below_zero() {
        let controller = controller();
        let outcome = controller.apply(TourCommand::Prev, 3).await;
        assert_eq!(outcome, TourControllerOutcome::FreshAsk { stop_index: 0 });
    }

    #[tokio::test]
    async fn continue_with_no_resume_entry_issues_fresh_ask() {
        let controller = controller();
        controller.apply(TourCommand::Start, 3).await;
        let outcome = controller.apply(TourCommand::Continue, 3).await;
        assert_eq!(outcome, TourControllerOutcome::FreshAsk { stop_index: 0 });
    }

    #[tokio::test]
    async fn continue_replays_and_consumes_question_resume_slot_once() {
        let controller = controller();
        controller
            .capture_question_resume(
                vec![Segment {
                    seq: 0,
                    stop_index: None,
                    content: crate::data::SegmentContent::Text("hello".into()),
                }],
                vec![],
            )
            .await;

        let outcome = controller.apply(TourCommand::Continue, 3).await;
        assert_eq!(outcome, TourControllerOutcome::Resumed);

        // Second continue finds nothing left in the question slot.
        let second = controller.apply(TourCommand::Continue, 3).await;
        assert!(matches!(second, TourControllerOutcome::FreshAsk { .. }));
    }

    #[tokio::test]
    async fn continue_replays_a_tour_stop_resume_entry() {
        let controller = controller();
        controller.apply(TourCommand::Start, 3).await;
        controller.apply(TourCommand::Pause, 3).await;
        {
            let mut buffer = controller.resume_buffer.lock().await;
            buffer.insert(
                0,
                ResumeEntry {
                    text_segments: vec![],
                    audio_segments: vec![AudioItem {
                        seq: 0,
                        stop_index: Some(0),
                        text: Some("synthesized segment".into()),
                        source: crate::data::AudioSource::StreamUrl("http://localhost/stale.wav".into()),
                    }],
                },
            );
        }

        let outcome = controller.apply(TourCommand::Continue, 3).await;
        assert_eq!(outcome, TourControllerOutcome::TourStopResumed { stop_index: 0 });
    }

    #[tokio::test]
    async fn reset_clears_resume_buffer_and_state() {
        let controller = controller();
        controller.apply(TourCommand::Start, 3).await;
        controller.apply(TourCommand::Reset, 3).await;
        let snapshot = controller.snapshot().await;
        assert_eq!(snapshot.stop_index, -1);
        assert_eq!(snapshot.mode, TourMode::Idle);
    }
}
