//! Directory and endpoint layout for the tour system, following the same `AppDirs`-rooted
//! default construction as `st_http`'s `TtsSystemConfig`.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Directories and remote endpoints the tour system needs to function.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TourSystemConfig {
    /// Directory storing the persisted client state file and any cached tour data.
    pub appdata_dir: PathBuf,
    /// Base URL of the remote answer/TTS/ASR server (§6 External Interfaces).
    pub server_base_url: String,
    /// Preferred output sample rate; the audio output actor re-opens the device when a WAV's
    /// native rate differs and resampling is cheaper done once up front.
    pub preferred_sample_rate: u32,
    /// Bounded look-ahead for TourPipeline's prefetcher (`MAX_PREFETCH_AHEAD`).
    pub max_prefetch_ahead: i64,
    /// Bounded pre-generation depth for TtsQueue (`MAX_PRE_GENERATE`).
    pub max_pre_generate: usize,
    /// High-priority group-mode preemption cooldown.
    pub high_priority_cooldown: Duration,
    /// Wake-word "stay active" window after a qualifying wake event.
    pub wake_hold_window: Duration,
    /// Minimum press-to-talk duration before a recording is accepted.
    pub min_recording_duration: Duration,
    /// How long a streaming ASR socket stays open after `stop` awaiting a `final` frame.
    pub asr_stop_grace_non_continuous: Duration,
    pub asr_stop_grace_continuous: Duration,
}

impl Default for TourSystemConfig {
    fn default() -> Self {
        let app_dir = crate::get_app_dirs().config_dir;
        Self {
            appdata_dir: app_dir.join("appdata"),
            server_base_url: "http://localhost:8200".to_string(),
            preferred_sample_rate: 16_000,
            max_prefetch_ahead: 1,
            max_pre_generate: 2,
            high_priority_cooldown: Duration::from_secs(4),
            wake_hold_window: Duration::from_secs(8),
            min_recording_duration: Duration::from_millis(900),
            asr_stop_grace_non_continuous: Duration::from_secs(8),
            asr_stop_grace_continuous: Duration::from_secs(2),
        }
    }
}

impl TourSystemConfig {
    pub fn persisted_state_path(&self) -> PathBuf {
        self.appdata_dir.join("client_state.json")
    }

    pub fn offline_manifest_path(&self) -> PathBuf {
        self.appdata_dir.join("offline_manifest.json")
    }
}
