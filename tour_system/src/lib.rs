//! Core streaming orchestration engine for the interactive voice-tour client: microphone
//! capture -> streaming ASR -> remote answer stream -> streaming TTS -> speaker playback, under
//! a tour state machine with race-free interruption.
//!
//! Module layout mirrors the component table: [`epoch`] (C5) underlies every other component;
//! [`audio`] (C1) and [`tts_queue`] (C2) form the playback pipeline; [`ask_driver`] (C3) and
//! [`tour_pipeline`] (C4) drive one turn/one tour respectively; [`tour_controller`] (C6) and
//! [`run_coordinator`] (C7) sit above those as command/policy layers; [`input_ingest`] (C8) and
//! [`offline_player`] (C9) are the remaining leaves.

pub mod ask_driver;
pub mod audio;
pub mod client;
pub mod config;
pub mod data;
pub mod epoch;
pub mod error;
pub mod events;
pub mod input_ingest;
pub mod offline_player;
pub mod persistence;
pub mod run_coordinator;
pub mod tour_controller;
pub mod tour_pipeline;
pub mod tour_voice_command;
pub mod tts_queue;

use std::path::PathBuf;
use std::sync::Arc;

use platform_dirs::AppDirs;

use crate::ask_driver::AskDriver;
use crate::audio::AudioOutputHandle;
use crate::config::TourSystemConfig;
use crate::epoch::InterruptEpoch;
use crate::events::EventSink;
use crate::offline_player::OfflineScriptPlayer;
use crate::persistence::PersistenceStore;
use crate::run_coordinator::RunCoordinator;
use crate::tour_controller::TourController;
use crate::tour_pipeline::TourPipeline;
use crate::tts_queue::TtsQueueHandle;

/// Retrieve the platform-appropriate application directories, following `AppDirs::new` the same
/// way `st_http::get_app_dirs` does.
pub fn get_app_dirs() -> AppDirs {
    platform_dirs::AppDirs::new("TourSystem".into(), false).expect("Couldn't find a home directory for config!")
}

/// Top-level handle wiring every component together for one running client session. Constructed
/// once by the application entry point, mirroring `st_http::setup::Application::new` wiring
/// `TtsSystem` before the rest of the app starts.
pub struct TourSystem {
    pub config: TourSystemConfig,
    pub epoch: InterruptEpoch,
    pub persistence: tokio::sync::Mutex<PersistenceStore>,
    pub audio: AudioOutputHandle,
    pub tts_queue: TtsQueueHandle,
    pub ask_driver: Arc<AskDriver>,
    pub tour_pipeline: Arc<TourPipeline>,
    pub tour_controller: TourController,
    pub run_coordinator: RunCoordinator,
    pub offline_player: OfflineScriptPlayer,
    pub api: client::TourApiClient,
    pub events: EventSink,
}

impl TourSystem {
    pub fn new(config: TourSystemConfig, group_mode: bool) -> eyre::Result<Self> {
        let persistence = PersistenceStore::create_or_load_from_file(config.persisted_state_path())?;
        let client_id = persistence.state().client_id.clone();

        let http = reqwest::Client::builder().build()?;
        let base_url = url::Url::parse(&config.server_base_url)?;

        let epoch = InterruptEpoch::new();
        let events = EventSink::new(http.clone(), base_url.clone(), client_id.clone());
        let audio = AudioOutputHandle::new(config.preferred_sample_rate);

        let base_url_for_builder = base_url.clone();
        let client_id_for_builder = client_id.clone();
        let url_builder: tts_queue::UrlBuilder = Arc::new(move |text, ctx| {
            let mut url = base_url_for_builder.join("/api/text_to_speech_stream").expect("static path");
            url.query_pairs_mut()
                .append_pair("text", text)
                .append_pair("request_id", &ctx.request_id)
                .append_pair("client_id", &client_id_for_builder)
                .append_pair("segment_index", &ctx.segment_index.to_string());
            if let Some(stop_index) = ctx.stop_index {
                url.query_pairs_mut().append_pair("stop_index", &stop_index.to_string());
            }
            url.to_string()
        });

        let tts_queue = TtsQueueHandle::new(client_id.clone(), config.max_pre_generate, http.clone(), audio.clone(), events.clone(), url_builder);
        let ask_driver = Arc::new(AskDriver::new(http.clone(), base_url.clone(), client_id.clone(), epoch.clone(), events.clone()));
        let tour_pipeline = Arc::new(TourPipeline::new(epoch.clone(), config.max_prefetch_ahead));
        let tour_controller = TourController::new(epoch.clone(), tour_pipeline.clone(), tts_queue.clone());
        let run_coordinator = RunCoordinator::new(group_mode, config.high_priority_cooldown);
        let offline_player = OfflineScriptPlayer::new(audio.clone(), http.clone(), events.clone());
        let api = client::TourApiClient::new(http.clone(), base_url.clone());

        Ok(Self {
            config,
            epoch,
            persistence: tokio::sync::Mutex::new(persistence),
            audio,
            tts_queue,
            ask_driver,
            tour_pipeline,
            tour_controller,
            run_coordinator,
            offline_player,
            api,
            events,
        })
    }
}
