//! AskDriver (C3): drives a single ask-turn end to end — sends the request, parses the
//! `data: <json>` streaming frames, pushes segments into TtsQueue, and awaits idle.
//!
//! The line-delimited JSON-frame parser here is the Rust-native implementation of the seam
//! `st_system` left as `unimplemented!("TODO, maybe")` (`TtsResult::Stream` in
//! `st_system/src/tts_backends/mod.rs`), built in the same request/response client style as
//! `tts_backends/alltalk/api.rs`.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::data::{GuideParams, PrefetchEntry, Segment, SegmentContent, TurnKind, TurnRequest};
use crate::epoch::InterruptEpoch;
use crate::error::AskError;
use crate::events::EventSink;
use crate::tts_queue::TtsQueueHandle;

/// Tail length kept from a prefetched answer, matching `TourPipeline`'s own continuity-tail clamp.
const PREFETCH_TAIL_CHARS: usize = 80;

#[derive(Debug, Serialize)]
struct AskRequestBody<'a> {
    question: &'a str,
    request_id: &'a str,
    client_id: &'a str,
    conversation_name: Option<&'a str>,
    agent_id: Option<&'a str>,
    recording_id: Option<&'a str>,
    guide: AskGuideBody<'a>,
    kind: &'a str,
}

#[derive(Debug, Serialize)]
struct AskGuideBody<'a> {
    enabled: bool,
    duration_s: Option<u32>,
    target_chars: Option<u32>,
    stop_name: Option<&'a str>,
    stop_index: Option<i64>,
    tour_action: Option<&'a str>,
    continuous: bool,
    style: Option<&'a str>,
}

#[derive(Debug, Deserialize, Default)]
struct AskFrame {
    #[serde(default)]
    chunk: Option<String>,
    #[serde(default)]
    segment: Option<String>,
    #[serde(default)]
    meta: Option<AskFrameMeta>,
    #[serde(default)]
    done: bool,
}

#[derive(Debug, Deserialize)]
struct AskFrameMeta {
    #[serde(default)]
    intent: Option<String>,
    #[serde(default)]
    intent_confidence: Option<f32>,
}

/// Outcome of one completed or cancelled ask-turn.
#[derive(Debug, Clone, Default)]
pub struct AskOutcome {
    pub full_answer: String,
    pub intent: Option<String>,
    pub segment_count: usize,
}

pub struct AskDriver {
    http: reqwest::Client,
    base_url: url::Url,
    client_id: String,
    epoch: InterruptEpoch,
    events: EventSink,
}

impl AskDriver {
    pub fn new(http: reqwest::Client, base_url: url::Url, client_id: String, epoch: InterruptEpoch, events: EventSink) -> Self {
        Self {
            http,
            base_url,
            client_id,
            epoch,
            events,
        }
    }

    /// Drive one ask-turn. `tts_queue` has already been reset for this run by the caller
    /// (RunCoordinator/TourController own that sequencing). On success, returns once the
    /// stream has finished AND the TtsQueue has drained.
    pub async fn drive(
        &self,
        request: &TurnRequest,
        tts_queue: &TtsQueueHandle,
        cancel: CancellationToken,
        on_tour_stop_done: impl Fn(i64) + Send + Sync + 'static,
    ) -> Result<AskOutcome, AskError> {
        let captured_epoch = self.epoch.snapshot();
        let body = self.build_body(request);

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(AskError::Cancelled),
            result = self.http.post(self.url("/api/ask")).json(&body).send() => {
                result.map_err(|source| AskError::Network { source })?
            }
        };

        let mut stream = response.bytes_stream();
        let mut line_buf = Vec::new();
        let mut full_answer = String::new();
        let mut intent = None;
        let mut segment_count = 0usize;
        let mut any_segment_arrived = false;

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(AskError::Cancelled);
                }
                next = stream.next() => next,
            };

            let Some(next) = next else { break };
            let bytes = next.map_err(|source| AskError::Network { source })?;
            line_buf.extend_from_slice(&bytes);

            while let Some(pos) = line_buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = line_buf.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let Some(json_part) = line.strip_prefix("data:") else { continue };

                if !self.epoch.is_current(captured_epoch) {
                    return Err(AskError::Cancelled);
                }

                let frame: AskFrame = serde_json::from_str(json_part.trim())
                    .map_err(|_| AskError::MalformedFrame { line: line.to_string() })?;

                if let Some(meta) = frame.meta {
                    intent = meta.intent;
                }
                if let Some(chunk) = frame.chunk {
                    full_answer.push_str(&chunk);
                }
                if let Some(segment) = frame.segment {
                    any_segment_arrived = true;
                    segment_count += 1;
                    tts_queue.enqueue_text(segment, request.stop_index).await;
                }
                if frame.done {
                    if !any_segment_arrived && !full_answer.is_empty() {
                        segment_count += 1;
                        tts_queue.enqueue_text(full_answer.clone(), request.stop_index).await;
                    }
                    tts_queue.mark_rag_done().await;
                    if let Some(stop_index) = request.stop_index {
                        on_tour_stop_done(stop_index);
                    }
                }
            }
        }

        if self.epoch.is_current(captured_epoch) {
            tts_queue.wait_for_idle().await;
        }

        Ok(AskOutcome {
            full_answer,
            intent,
            segment_count,
        })
    }

    /// Run an `ask_prefetch` turn to completion, capturing segments into a [`PrefetchEntry`]
    /// instead of pushing them into a `TtsQueueHandle`. This is the `fetch` half of
    /// `TourPipeline::maybe_prefetch_next_stop`'s chained network call.
    pub async fn prefetch(&self, stop_index: i64, question_text: &str, guide: Option<GuideParams>, request_id: String) -> Result<PrefetchEntry, AskError> {
        let request = TurnRequest {
            request_id,
            kind: TurnKind::AskPrefetch,
            stop_index: Some(stop_index),
            question_text: question_text.to_string(),
            guide,
        };
        let captured_epoch = self.epoch.snapshot();
        let body = self.build_body(&request);

        let response = self
            .http
            .post(self.url("/api/ask"))
            .json(&body)
            .send()
            .await
            .map_err(|source| AskError::Network { source })?;

        let mut stream = response.bytes_stream();
        let mut line_buf = Vec::new();
        let mut full_answer = String::new();
        let mut segments = Vec::new();
        let mut seq = 0u64;

        while let Some(next) = stream.next().await {
            let bytes = next.map_err(|source| AskError::Network { source })?;
            line_buf.extend_from_slice(&bytes);

            while let Some(pos) = line_buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = line_buf.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let Some(json_part) = line.strip_prefix("data:") else { continue };

                if !self.epoch.is_current(captured_epoch) {
                    return Err(AskError::Cancelled);
                }

                let frame: AskFrame = serde_json::from_str(json_part.trim())
                    .map_err(|_| AskError::MalformedFrame { line: line.to_string() })?;

                if let Some(chunk) = frame.chunk {
                    full_answer.push_str(&chunk);
                }
                if let Some(segment) = frame.segment {
                    segments.push(Segment {
                        seq,
                        stop_index: Some(stop_index),
                        content: SegmentContent::Text(segment),
                    });
                    seq += 1;
                }
                if frame.done && segments.is_empty() && !full_answer.is_empty() {
                    segments.push(Segment {
                        seq,
                        stop_index: Some(stop_index),
                        content: SegmentContent::Text(full_answer.clone()),
                    });
                }
            }
        }

        Ok(PrefetchEntry {
            tail: tail_of(&full_answer),
            answer_text: full_answer,
            segments,
            audio_segments: Vec::new(),
            created_at: std::time::Instant::now(),
        })
    }

    fn build_body<'a>(&self, request: &'a TurnRequest) -> AskRequestBody<'a> {
        let guide = request.guide.as_ref();
        AskRequestBody {
            question: &request.question_text,
            request_id: &request.request_id,
            client_id: &self.client_id,
            conversation_name: None,
            agent_id: None,
            recording_id: None,
            guide: AskGuideBody {
                enabled: guide.is_some(),
                duration_s: guide.and_then(|g| g.duration_s),
                target_chars: guide.and_then(|g| g.target_chars),
                stop_name: None,
                stop_index: request.stop_index,
                tour_action: Some(turn_kind_action(request)),
                continuous: guide.map(|g| g.continuous).unwrap_or(false),
                style: guide.and_then(|g| g.style.as_deref()),
            },
            kind: turn_kind_action(request),
        }
    }

    fn url(&self, path: &str) -> url::Url {
        self.base_url.join(path).expect("static path should always join")
    }
}

fn tail_of(answer: &str) -> String {
    let trimmed = answer.trim();
    if trimmed.chars().count() <= PREFETCH_TAIL_CHARS {
        trimmed.to_string()
    } else {
        let skip = trimmed.chars().count() - PREFETCH_TAIL_CHARS;
        trimmed.chars().skip(skip).collect()
    }
}

fn turn_kind_action(request: &TurnRequest) -> &'static str {
    use crate::data::TurnKind::*;
    match request.kind {
        UserQuestion => "user_question",
        TourStart => "start",
        TourContinue => "continue",
        TourNext => "next",
        TourPrev => "prev",
        TourJump => "jump",
        AskPrefetch => "ask_prefetch",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::TurnKind;

    #[test]
    fn tail_of_keeps_short_answers_whole() {
        assert_eq!(tail_of("  hello there  "), "hello there");
    }

    #[test]
    fn tail_of_clamps_long_answers_to_the_last_80_chars() {
        let long: String = std::iter::repeat('字').take(200).collect();
        let tail = tail_of(&long);
        assert_eq!(tail.chars().count(), PREFETCH_TAIL_CHARS);
    }

    #[test]
    fn frame_with_only_chunks_parses_without_segment_field() {
        let frame: AskFrame = serde_json::from_str(r#"{"chunk":"hello "}"#).unwrap();
        assert_eq!(frame.chunk.as_deref(), Some("hello "));
        assert!(frame.segment.is_none());
        assert!(!frame.done);
    }

    #[test]
    fn done_frame_with_meta_parses_intent() {
        let frame: AskFrame = serde_json::from_str(r#"{"done":true,"meta":{"intent":"question","intent_confidence":0.9}}"#).unwrap();
        assert!(frame.done);
        assert_eq!(frame.meta.unwrap().intent.as_deref(), Some("question"));
    }

    #[test]
    fn turn_kind_action_maps_every_variant() {
        let mut request = TurnRequest {
            request_id: "r".into(),
            kind: TurnKind::TourNext,
            stop_index: None,
            question_text: String::new(),
            guide: None,
        };
        assert_eq!(turn_kind_action(&request), "next");
        request.kind = TurnKind::UserQuestion;
        assert_eq!(turn_kind_action(&request), "user_question");
    }
}
