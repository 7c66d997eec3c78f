//! TtsQueue (C2): an ordered text->audio pipeline with bounded pre-generation and two
//! cooperating workers (generator, player) per run.
//!
//! Grounded on `st_system/src/session/order_channel.rs` + `queue_actor.rs`: the generator and
//! player are two halves of one actor driven by the same run token, rather than two independent
//! priority lanes — here modelled as two plain `VecDeque`s behind a `Mutex` plus a `Notify`
//! instead of a capacity-1 notify-channel per worker, since both halves wake on the same
//! condition (state changed for the current token).

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Notify};

use crate::audio::AudioOutputHandle;
use crate::data::{AudioItem, AudioSource, Segment, SegmentContent};
use crate::error::AudioError;
use crate::events::EventSink;

/// Context passed to the synthesis URL builder for one segment.
#[derive(Debug, Clone)]
pub struct SynthesisContext {
    pub request_id: String,
    pub client_id: String,
    pub segment_index: u64,
    pub stop_index: Option<i64>,
    pub recording_id: Option<String>,
}

pub type UrlBuilder = Arc<dyn Fn(&str, &SynthesisContext) -> String + Send + Sync>;

struct QueueState {
    token: u64,
    request_id: String,
    text_queue: VecDeque<Segment>,
    audio_queue: VecDeque<AudioItem>,
    seen_texts: HashSet<String>,
    rag_done: bool,
    generator_running: bool,
    player_running: bool,
    next_seq: u64,
    /// The item the player is currently playing, if any; popped from `audio_queue` so it would
    /// otherwise be invisible to the resume-buffer capture.
    current_playing: Option<AudioItem>,
}

impl QueueState {
    fn new(token: u64, request_id: String) -> Self {
        Self {
            token,
            request_id,
            text_queue: VecDeque::new(),
            audio_queue: VecDeque::new(),
            seen_texts: HashSet::new(),
            rag_done: false,
            generator_running: false,
            player_running: false,
            next_seq: 0,
            current_playing: None,
        }
    }

    fn idle(&self) -> bool {
        !self.generator_running && !self.player_running && self.text_queue.is_empty() && self.audio_queue.is_empty()
    }
}

struct Inner {
    state: Mutex<QueueState>,
    wake: Notify,
    idle_notify: Notify,
    max_pre_generate: usize,
    client_id: String,
    http: reqwest::Client,
    audio: AudioOutputHandle,
    events: EventSink,
    url_builder: UrlBuilder,
}

/// Cheaply-clonable front handle for the TTS queue.
#[derive(Clone)]
pub struct TtsQueueHandle {
    inner: Arc<Inner>,
}

impl TtsQueueHandle {
    pub fn new(
        client_id: String,
        max_pre_generate: usize,
        http: reqwest::Client,
        audio: AudioOutputHandle,
        events: EventSink,
        url_builder: UrlBuilder,
    ) -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(QueueState::new(0, String::new())),
            wake: Notify::new(),
            idle_notify: Notify::new(),
            max_pre_generate,
            client_id,
            http,
            audio,
            events,
            url_builder,
        });
        Self { inner }
    }

    /// Stop the current run, bump the local token, clear both queues and the dedup set. Workers
    /// start lazily the next time this returns and `enqueue_*`/`mark_rag_done` are called.
    pub async fn reset_for_run(&self, request_id: impl Into<String>) -> u64 {
        self.inner.audio.stop().await;
        let mut state = self.inner.state.lock().await;
        state.token += 1;
        state.request_id = request_id.into();
        state.text_queue.clear();
        state.audio_queue.clear();
        state.seen_texts.clear();
        state.rag_done = false;
        state.next_seq = 0;
        state.current_playing = None;
        let token = state.token;
        drop(state);
        self.ensure_running(token);
        token
    }

    pub async fn enqueue_text(&self, text: impl Into<String>, stop_index: Option<i64>) {
        let text = text.into();
        let mut state = self.inner.state.lock().await;
        if !state.seen_texts.insert(text.clone()) {
            tracing::debug!(text = %text, "dropped duplicate segment");
            return;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.text_queue.push_back(Segment {
            seq,
            stop_index,
            content: SegmentContent::Text(text),
        });
        let token = state.token;
        drop(state);
        self.inner.wake.notify_waiters();
        self.ensure_running(token);
    }

    pub async fn enqueue_wav_bytes(&self, bytes: bytes::Bytes, stop_index: Option<i64>, text: Option<String>) {
        let mut state = self.inner.state.lock().await;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.audio_queue.push_back(AudioItem {
            seq,
            stop_index,
            text,
            source: AudioSource::Bytes(bytes),
        });
        let token = state.token;
        drop(state);
        self.inner.wake.notify_waiters();
        self.ensure_running(token);
    }

    pub async fn enqueue_audio_url(&self, url: impl Into<String>, stop_index: Option<i64>, text: Option<String>) {
        let mut state = self.inner.state.lock().await;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.audio_queue.push_back(AudioItem {
            seq,
            stop_index,
            text,
            source: AudioSource::RecordedUrl(url.into()),
        });
        let token = state.token;
        drop(state);
        self.inner.wake.notify_waiters();
        self.ensure_running(token);
    }

    pub async fn mark_rag_done(&self) {
        let mut state = self.inner.state.lock().await;
        state.rag_done = true;
        drop(state);
        self.inner.wake.notify_waiters();
    }

    /// Ordered, deduped snapshot of still-unplayed text segments for `stop_index`, including the
    /// currently-playing item. Used by TourController to build the ResumeBuffer at interrupt
    /// time.
    pub async fn capture_pending_text_by_stop_index(&self, stop_index: i64) -> Vec<Segment> {
        let state = self.inner.state.lock().await;
        state
            .text_queue
            .iter()
            .filter(|s| s.stop_index == Some(stop_index))
            .cloned()
            .collect()
    }

    pub async fn capture_pending_audio_by_stop_index(&self, stop_index: i64) -> Vec<AudioItem> {
        let state = self.inner.state.lock().await;
        state
            .current_playing
            .iter()
            .filter(|a| a.stop_index == Some(stop_index))
            .cloned()
            .chain(state.audio_queue.iter().filter(|a| a.stop_index == Some(stop_index)).cloned())
            .collect()
    }

    /// Resolves once the current token's generator and player have both exited and both queues
    /// are empty.
    pub async fn wait_for_idle(&self) {
        loop {
            {
                let state = self.inner.state.lock().await;
                if state.idle() {
                    return;
                }
            }
            self.inner.idle_notify.notified().await;
        }
    }

    fn ensure_running(&self, token: u64) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            maybe_start_generator(&inner, token).await;
        });
        let inner = self.inner.clone();
        tokio::spawn(async move {
            maybe_start_player(&inner, token).await;
        });
    }
}

async fn maybe_start_generator(inner: &Arc<Inner>, token: u64) {
    {
        let mut state = inner.state.lock().await;
        if state.token != token || state.generator_running {
            return;
        }
        state.generator_running = true;
    }

    loop {
        let mut state = inner.state.lock().await;
        if state.token != token {
            state.generator_running = false;
            drop(state);
            notify_idle(inner).await;
            return;
        }
        if state.audio_queue.len() >= inner.max_pre_generate {
            drop(state);
            tokio::time::sleep(Duration::from_millis(50)).await;
            continue;
        }
        let Some(segment) = state.text_queue.pop_front() else {
            if state.rag_done {
                state.generator_running = false;
                drop(state);
                notify_idle(inner).await;
                return;
            }
            drop(state);
            inner.wake.notified().await;
            continue;
        };
        let request_id = state.request_id.clone();
        let seq = segment.seq;
        drop(state);

        if let SegmentContent::Text(text) = &segment.content {
            let ctx = SynthesisContext {
                request_id,
                client_id: inner.client_id.clone(),
                segment_index: seq,
                stop_index: segment.stop_index,
                recording_id: None,
            };
            let url = (inner.url_builder)(text, &ctx);
            let mut state = inner.state.lock().await;
            if state.token != token {
                state.generator_running = false;
                drop(state);
                notify_idle(inner).await;
                return;
            }
            state.audio_queue.push_back(AudioItem {
                seq,
                stop_index: segment.stop_index,
                text: Some(text.clone()),
                source: AudioSource::StreamUrl(url),
            });
            drop(state);
            inner.wake.notify_waiters();
        }
    }
}

async fn maybe_start_player(inner: &Arc<Inner>, token: u64) {
    let mut last_stop_index: Option<Option<i64>> = None;
    {
        let mut state = inner.state.lock().await;
        if state.token != token || state.player_running {
            return;
        }
        state.player_running = true;
    }

    loop {
        let item = {
            let mut state = inner.state.lock().await;
            if state.token != token {
                state.player_running = false;
                drop(state);
                notify_idle(inner).await;
                return;
            }
            match state.audio_queue.pop_front() {
                Some(item) => {
                    state.current_playing = Some(item.clone());
                    Some(item)
                }
                None if state.rag_done && state.text_queue.is_empty() => {
                    state.player_running = false;
                    drop(state);
                    inner.events.emit(None, "play_end", serde_json::json!({}));
                    notify_idle(inner).await;
                    return;
                }
                None => None,
            }
        };

        let Some(item) = item else {
            inner.wake.notified().await;
            continue;
        };

        if last_stop_index.is_some() && last_stop_index != Some(item.stop_index) {
            tracing::debug!(stop_index = ?item.stop_index, "tts queue crossed a stop-index boundary");
        }
        last_stop_index = Some(item.stop_index);

        let result = play_item(inner, &item).await;
        if let Err(AudioError::AbnormalAudio { reason }) = &result {
            inner.events.emit(None, "tts_audio_abnormal", serde_json::json!({ "reason": reason }));
            let mut state = inner.state.lock().await;
            state.player_running = false;
            state.current_playing = None;
            state.audio_queue.clear();
            drop(state);
            notify_idle(inner).await;
            return;
        } else if let Err(err) = &result {
            tracing::warn!(?err, "tts queue player failed on one item, continuing");
        }

        {
            let mut state = inner.state.lock().await;
            state.current_playing = None;
            if state.token != token {
                state.player_running = false;
                drop(state);
                notify_idle(inner).await;
                return;
            }
        }
    }
}

async fn play_item(inner: &Arc<Inner>, item: &AudioItem) -> Result<(), AudioError> {
    match &item.source {
        // Pre-generated bytes already sit in memory whole; nothing to stream.
        AudioSource::Bytes(bytes) => {
            inner.audio.play_finished_buffer(bytes.to_vec()).await?;
            Ok(())
        }
        // Freshly-synthesized segments go through AudioOutput's streaming path (§4.1): the
        // response body is forwarded chunk-by-chunk so jitter buffering and the sanity probe see
        // audio as it arrives instead of after the whole segment has downloaded.
        AudioSource::StreamUrl(url) => play_streamed(inner, url).await,
        // Recorded-tour audio is a finished file the server already wrote out; buffered decode
        // matches the saved-WAV path (§4.2's "buffered-decode path with element fallback" — the
        // element fallback itself lives in AudioOutput's failure escalation).
        AudioSource::RecordedUrl(url) => {
            let response = inner
                .http
                .get(url)
                .send()
                .await
                .map_err(|e| AudioError::Decode { message: e.to_string() })?;
            let bytes = response.bytes().await.map_err(|e| AudioError::Decode { message: e.to_string() })?;
            inner.audio.play_finished_buffer(bytes.to_vec()).await?;
            Ok(())
        }
    }
}

async fn play_streamed(inner: &Arc<Inner>, url: &str) -> Result<(), AudioError> {
    use futures::StreamExt;

    let response = inner
        .http
        .get(url)
        .send()
        .await
        .map_err(|e| AudioError::Decode { message: e.to_string() })?;

    let (tx, rx) = mpsc::channel::<bytes::Bytes>(8);
    let mut body = response.bytes_stream();
    let pump = async move {
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => {
                    if tx.send(bytes).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    };

    let (outcome, _) = tokio::join!(inner.audio.play_stream(rx), pump);
    outcome.map(|_| ())
}

async fn notify_idle(inner: &Arc<Inner>) {
    let state = inner.state.lock().await;
    if state.idle() {
        drop(state);
        inner.idle_notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventSink;

    fn test_handle() -> TtsQueueHandle {
        let audio = AudioOutputHandle::new(16_000);
        let http = reqwest::Client::new();
        let events = EventSink::new(http.clone(), url::Url::parse("http://localhost:1").unwrap(), "client".into());
        let builder: UrlBuilder = Arc::new(|text, ctx| format!("http://localhost/tts?text={text}&seq={}", ctx.segment_index));
        TtsQueueHandle::new("client".into(), 2, http, audio, events, builder)
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn dedup_drops_repeated_text_within_a_run() {
        let queue = test_handle();
        queue.reset_for_run("r1").await;
        queue.enqueue_text("hello", None).await;
        queue.enqueue_text("hello", None).await;
        queue.mark_rag_done().await;

        let state = queue.inner.state.lock().await;
        let total_queued = state.text_queue.len() + state.audio_queue.len();
        assert!(total_queued <= 1);
        assert!(logs_contain("dropped duplicate segment"));
    }

    #[tokio::test]
    async fn reset_for_run_clears_dedup_set_across_runs() {
        let queue = test_handle();
        queue.reset_for_run("r1").await;
        queue.enqueue_text("hello", None).await;
        queue.reset_for_run("r2").await;
        queue.enqueue_text("hello", None).await;

        let state = queue.inner.state.lock().await;
        assert_eq!(state.seen_texts.len(), 1);
    }

    #[tokio::test]
    async fn capture_pending_audio_includes_the_currently_playing_item() {
        let queue = test_handle();
        queue.reset_for_run("r1").await;
        queue.enqueue_audio_url("http://localhost/queued.wav", Some(3), None).await;
        {
            let mut state = queue.inner.state.lock().await;
            state.current_playing = Some(AudioItem {
                seq: 0,
                stop_index: Some(3),
                text: None,
                source: AudioSource::StreamUrl("http://localhost/playing.wav".into()),
            });
        }

        let captured = queue.capture_pending_audio_by_stop_index(3).await;
        assert_eq!(captured.len(), 2);
        assert!(matches!(&captured[0].source, AudioSource::StreamUrl(u) if u == "http://localhost/playing.wav"));
    }

    #[tokio::test]
    async fn seq_is_strictly_increasing_within_a_run() {
        let queue = test_handle();
        queue.reset_for_run("r1").await;
        queue.enqueue_text("a", None).await;
        queue.enqueue_text("b", None).await;
        queue.enqueue_text("c", None).await;

        let state = queue.inner.state.lock().await;
        let seqs: Vec<u64> = state.text_queue.iter().map(|s| s.seq).collect();
        let mut sorted = seqs.clone();
        sorted.sort();
        assert_eq!(seqs, sorted);
    }
}
