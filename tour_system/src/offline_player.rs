//! OfflineScriptPlayer (C9): sequential playback of a pre-baked manifest when the online path
//! is unhealthy.
//!
//! A smaller sibling of [`crate::audio::AudioOutputHandle`], reusing the same generation-token
//! "am I still the active run" idiom used throughout (`TtsRunToken`, `InterruptEpoch`), sequencing
//! a fixed manifest instead of a live queue — the same `rodio::Sink` lifecycle as
//! `PlaybackEngine`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::audio::AudioOutputHandle;
use crate::events::EventSink;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineManifestItem {
    pub id: String,
    pub stop_id: String,
    pub stop_name: String,
    pub audio_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineManifest {
    pub title: String,
    pub items: Vec<OfflineManifestItem>,
}

pub struct OfflineScriptPlayer {
    token: Arc<AtomicU64>,
    audio: AudioOutputHandle,
    http: reqwest::Client,
    events: EventSink,
}

impl OfflineScriptPlayer {
    pub fn new(audio: AudioOutputHandle, http: reqwest::Client, events: EventSink) -> Self {
        Self {
            token: Arc::new(AtomicU64::new(0)),
            audio,
            http,
            events,
        }
    }

    /// Stop the current manifest playback, if any. The active `play()` loop breaks after its
    /// current item.
    pub fn stop(&self) {
        self.token.fetch_add(1, Ordering::SeqCst);
        self.events.emit(None, "offline_play_cancelled", serde_json::json!({}));
    }

    pub async fn play(&self, manifest: OfflineManifest) {
        let my_token = self.token.fetch_add(1, Ordering::SeqCst) + 1;
        self.events.emit(None, "offline_play_start", serde_json::json!({ "title": manifest.title }));

        for item in &manifest.items {
            if self.token.load(Ordering::SeqCst) != my_token {
                self.events.emit(None, "offline_play_cancelled", serde_json::json!({}));
                return;
            }

            self.events.emit(
                None,
                "offline_item_start",
                serde_json::json!({ "id": item.id, "stop_id": item.stop_id }),
            );

            match self.fetch_and_play(item).await {
                Ok(()) => {
                    self.events.emit(None, "offline_item_end", serde_json::json!({ "id": item.id }));
                }
                Err(err) => {
                    tracing::warn!(?err, item = item.id, "offline script item failed");
                    self.events
                        .emit(None, "offline_item_failed", serde_json::json!({ "id": item.id, "error": err.to_string() }));
                }
            }
        }

        if self.token.load(Ordering::SeqCst) == my_token {
            self.events.emit(None, "offline_play_end", serde_json::json!({}));
        }
    }

    async fn fetch_and_play(&self, item: &OfflineManifestItem) -> Result<(), crate::error::AudioError> {
        let response = self
            .http
            .get(&item.audio_url)
            .send()
            .await
            .map_err(|e| crate::error::AudioError::Decode { message: e.to_string() })?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| crate::error::AudioError::Decode { message: e.to_string() })?;
        self.audio.play_finished_buffer(bytes.to_vec()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_before_play_bumps_token_without_panicking() {
        let audio = AudioOutputHandle::new(16_000);
        let http = reqwest::Client::new();
        let events = EventSink::new(http.clone(), url::Url::parse("http://localhost:1").unwrap(), "client".into());
        let player = OfflineScriptPlayer::new(audio, http, events);
        player.stop();
        assert_eq!(player.token.load(Ordering::SeqCst), 1);
    }
}
