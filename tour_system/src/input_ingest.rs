//! InputIngest (C8): press-to-talk recorder and wake-word listener over a streaming ASR
//! websocket, with wake-hold gating and mic/listener handoff.
//!
//! The mic-capture callback hands `i16` frames off to async code through a bounded channel, the
//! same "real-time callback hands off through a channel to async code" shape as
//! `st_system/src/playback.rs`'s `spawn_blocking` + `block_on` split (there: audio actor on a
//! blocking thread; here: `cpal`'s realtime callback feeding an async task). The websocket
//! client is structured as the same handle/actor pair as every other component here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_tungstenite::tungstenite::Message;

use crate::error::IngestError;

#[derive(Debug, Serialize)]
struct StartFrame {
    #[serde(rename = "type")]
    kind: &'static str,
    sample_rate: u32,
    encoding: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    wake_word: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AsrFrame {
    Partial { text: String },
    Final { text: String },
    Wake,
    Info { message: String },
    Error { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestRole {
    PressToTalk,
    WakeListener,
}

/// Tracks the wake-word "stay active" window and mic hand-off between press-to-talk and the
/// wake listener.
pub struct WakeGate {
    hold_window: Duration,
    woken: Mutex<Option<Instant>>,
    paused_for_manual: AtomicBool,
}

impl WakeGate {
    pub fn new(hold_window: Duration) -> Self {
        Self {
            hold_window,
            woken: Mutex::new(None),
            paused_for_manual: AtomicBool::new(false),
        }
    }

    pub async fn on_wake(&self) {
        *self.woken.lock().await = Some(Instant::now());
    }

    /// A partial/final refreshes the window only if we're currently inside it (or wake-word
    /// gating isn't configured at all, represented by always calling `on_wake` first upstream).
    pub async fn accept_and_refresh(&self) -> bool {
        let mut woken = self.woken.lock().await;
        match *woken {
            Some(at) if at.elapsed() < self.hold_window => {
                *woken = Some(Instant::now());
                true
            }
            Some(_) => false,
            None => false,
        }
    }

    pub fn pause_for_manual_recording(&self) {
        self.paused_for_manual.store(true, Ordering::SeqCst);
    }

    pub fn is_paused_for_manual(&self) -> bool {
        self.paused_for_manual.load(Ordering::SeqCst)
    }

    pub fn resume_after_manual(&self) {
        self.paused_for_manual.store(false, Ordering::SeqCst);
    }
}

/// Minimum accepted press-to-talk recording duration guard (§4.8).
pub fn validate_recording_duration(elapsed: Duration, minimum: Duration) -> Result<(), IngestError> {
    if elapsed < minimum {
        Err(IngestError::RecordingTooShort {
            millis: elapsed.as_millis() as u64,
        })
    } else {
        Ok(())
    }
}

/// A one-shot HTTP transcription of a recorded clip.
pub struct HttpAsrClient {
    http: reqwest::Client,
    base_url: url::Url,
    client_id: String,
}

impl HttpAsrClient {
    pub fn new(http: reqwest::Client, base_url: url::Url, client_id: String) -> Self {
        Self { http, base_url, client_id }
    }

    pub async fn transcribe(&self, wav_bytes: Vec<u8>) -> Result<String, IngestError> {
        let form = reqwest::multipart::Form::new()
            .part("audio", reqwest::multipart::Part::bytes(wav_bytes).file_name("clip.wav"))
            .text("client_id", self.client_id.clone());

        let url = self.base_url.join("/api/speech_to_text").expect("static path");
        let response = self
            .http
            .post(url)
            .multipart(form)
            .send()
            .await
            .map_err(|source| IngestError::Network { source })?;
        #[derive(Deserialize)]
        struct Resp {
            text: String,
        }
        let resp: Resp = response.json().await.map_err(|source| IngestError::Network { source })?;
        Ok(resp.text)
    }
}

/// Back-pressure guard: never send while more than 1 MiB is still buffered on the socket.
const MAX_BUFFERED_BYTES: usize = 1024 * 1024;

/// Owns one streaming ASR websocket session for either the press-to-talk or wake-listener role.
pub struct StreamingAsrSession {
    tx: mpsc::Sender<AsrCommand>,
    /// Set once `stop` has been sent or a `final` frame has arrived, so a subsequent socket
    /// error is a benign race rather than a real failure (§5: "ws_error after we already sent
    /// stop or received final is ignored").
    settled: Arc<AtomicBool>,
    got_final: Arc<Notify>,
    got_final_flag: Arc<AtomicBool>,
}

enum AsrCommand {
    Audio(bytes::Bytes),
    Stop,
}

impl StreamingAsrSession {
    pub async fn connect(
        ws_url: url::Url,
        role: IngestRole,
        wake_word: Option<String>,
        on_frame: impl Fn(AsrFrame) + Send + Sync + 'static,
    ) -> Result<Self, IngestError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(ws_url.as_str())
            .await
            .map_err(|e| IngestError::WsProtocol { message: e.to_string() })?;
        let (mut write, mut read) = ws_stream.split();

        let start = StartFrame {
            kind: "start",
            sample_rate: 16_000,
            encoding: "pcm_s16le",
            wake_word,
        };
        let start_json = serde_json::to_string(&start).expect("start frame always serialisable");
        write
            .send(Message::Text(start_json.into()))
            .await
            .map_err(|e| IngestError::WsProtocol { message: e.to_string() })?;

        let (tx, mut rx) = mpsc::channel::<AsrCommand>(64);
        let _role = role;

        let settled = Arc::new(AtomicBool::new(false));
        let got_final = Arc::new(Notify::new());
        let got_final_flag = Arc::new(AtomicBool::new(false));

        let write_settled = settled.clone();
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    AsrCommand::Audio(bytes) => {
                        if write.send(Message::Binary(bytes.to_vec().into())).await.is_err() {
                            break;
                        }
                    }
                    AsrCommand::Stop => {
                        write_settled.store(true, Ordering::SeqCst);
                        let _ = write.send(Message::Text("{\"type\":\"stop\"}".into())).await;
                    }
                }
            }
        });

        let read_settled = settled.clone();
        let read_got_final = got_final.clone();
        let read_got_final_flag = got_final_flag.clone();
        tokio::spawn(async move {
            loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(frame) = serde_json::from_str::<AsrFrame>(&text) {
                            if matches!(frame, AsrFrame::Final { .. }) {
                                read_settled.store(true, Ordering::SeqCst);
                                read_got_final_flag.store(true, Ordering::SeqCst);
                                read_got_final.notify_waiters();
                            }
                            on_frame(frame);
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        if !read_settled.load(Ordering::SeqCst) {
                            tracing::warn!(?err, "asr websocket error");
                        }
                        break;
                    }
                    None => break,
                }
            }
        });

        Ok(Self {
            tx,
            settled,
            got_final,
            got_final_flag,
        })
    }

    /// Push a PCM16LE frame, honoring the 1 MiB back-pressure ceiling by dropping the frame
    /// (never blocking the realtime capture callback).
    pub async fn push_audio(&self, frame: bytes::Bytes, currently_buffered_bytes: usize) {
        if currently_buffered_bytes > MAX_BUFFERED_BYTES {
            tracing::debug!("asr socket over back-pressure ceiling, dropping frame");
            return;
        }
        let _ = self.tx.send(AsrCommand::Audio(frame)).await;
    }

    pub async fn stop(&self) {
        let _ = self.tx.send(AsrCommand::Stop).await;
    }

    /// Send `stop` and keep the socket open up to `grace` awaiting a `final` frame (§4.8: 8s
    /// non-continuous, 2s continuous), then return regardless of whether one arrived — the
    /// caller force-closes by dropping the session.
    pub async fn stop_and_wait_for_final(&self, grace: Duration) {
        self.settled.store(true, Ordering::SeqCst);
        let _ = self.tx.send(AsrCommand::Stop).await;
        if self.got_final_flag.load(Ordering::SeqCst) {
            return;
        }
        let _ = tokio::time::timeout(grace, self.got_final.notified()).await;
    }
}

/// Front handle wiring mic capture (via `cpal`) into a bounded channel consumed by async code.
pub struct MicCaptureHandle {
    frames_rx: Arc<Mutex<mpsc::Receiver<Vec<i16>>>>,
    _stream_guard: Arc<dyn std::any::Any + Send + Sync>,
}

impl MicCaptureHandle {
    /// Construction lives at the call site in `tour_cli` (platform-specific default device
    /// selection is an application concern, not a library one); this wraps an already-built
    /// `cpal::Stream` behind the channel contract the rest of the crate expects.
    pub fn from_stream<S: Send + Sync + 'static>(stream: S, frames_rx: mpsc::Receiver<Vec<i16>>) -> Self {
        Self {
            frames_rx: Arc::new(Mutex::new(frames_rx)),
            _stream_guard: Arc::new(stream),
        }
    }

    pub async fn recv_frame(&self) -> Option<Vec<i16>> {
        self.frames_rx.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_recording_is_rejected() {
        let err = validate_recording_duration(Duration::from_millis(300), Duration::from_millis(900));
        assert!(matches!(err, Err(IngestError::RecordingTooShort { millis: 300 })));
    }

    #[test]
    fn long_enough_recording_is_accepted() {
        assert!(validate_recording_duration(Duration::from_millis(950), Duration::from_millis(900)).is_ok());
    }

    #[tokio::test]
    async fn wake_gate_ignores_partials_before_wake() {
        let gate = WakeGate::new(Duration::from_secs(8));
        assert!(!gate.accept_and_refresh().await);
    }

    #[tokio::test]
    async fn wake_gate_accepts_within_hold_window_after_wake() {
        let gate = WakeGate::new(Duration::from_secs(8));
        gate.on_wake().await;
        assert!(gate.accept_and_refresh().await);
    }

    #[tokio::test]
    async fn wake_gate_rejects_after_hold_window_expires() {
        let gate = WakeGate::new(Duration::from_millis(10));
        gate.on_wake().await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!gate.accept_and_refresh().await);
    }

    #[test]
    fn manual_pause_and_resume_round_trip() {
        let gate = WakeGate::new(Duration::from_secs(8));
        assert!(!gate.is_paused_for_manual());
        gate.pause_for_manual_recording();
        assert!(gate.is_paused_for_manual());
        gate.resume_after_manual();
        assert!(!gate.is_paused_for_manual());
    }

    #[test]
    fn asr_frame_deserialises_each_variant() {
        let partial: AsrFrame = serde_json::from_str(r#"{"type":"partial","text":"hi"}"#).unwrap();
        assert!(matches!(partial, AsrFrame::Partial { .. }));
        let wake: AsrFrame = serde_json::from_str(r#"{"type":"wake"}"#).unwrap();
        assert!(matches!(wake, AsrFrame::Wake));
    }
}
