//! Application wiring: constructs one [`tour_system::TourSystem`] and drives the top-level
//! command loop. Mirrors `st_http::setup::Application::new` constructing `TtsSystem` before
//! anything else starts, and `st_http::get_quit_notifier`/`Application::run`'s
//! select-on-ctrl-c-or-quit-notifier shutdown shape — generalised from "serve HTTP requests" to
//! "read tour commands from stdin", since this client has no server loop of its own.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Notify;

use tour_system::ask_driver::AskOutcome;
use tour_system::data::{GuideParams, TurnKind, TurnRequest};
use tour_system::run_coordinator::SubmitOutcome;
use tour_system::tour_controller::{TourCommand, TourControllerOutcome};
use tour_system::tour_pipeline::TourPipeline;
use tour_system::TourSystem;

use crate::config::Config;

pub struct Application {
    pub system: TourSystem,
}

impl Application {
    #[tracing::instrument(name = "Create application", skip(config))]
    pub async fn new(config: Config) -> eyre::Result<Self> {
        let system = TourSystem::new(config.system, config.group_mode)?;
        Ok(Self { system })
    }

    /// Drive the interactive command loop until EOF on stdin or a shutdown signal.
    ///
    /// The future completes when the Tokio runtime has been asked to shut down (e.g. by a
    /// SIGINT) or stdin closes.
    pub async fn run(self, quitter: Arc<Notify>) -> eyre::Result<()> {
        tracing::info!("Setup complete, entering command loop...");

        let stdin = BufReader::new(tokio::io::stdin());
        let mut lines = stdin.lines();

        loop {
            let line = tokio::select! {
                _ = quitter.notified() => break,
                res = tokio::signal::ctrl_c() => {
                    res.ok();
                    quitter.notify_waiters();
                    break;
                }
                line = lines.next_line() => line?,
            };

            let Some(line) = line else {
                break;
            };

            if let Err(err) = self.handle_line(line.trim()).await {
                tracing::warn!(?err, "command failed");
            }
        }

        Ok(())
    }

    async fn handle_line(&self, line: &str) -> eyre::Result<()> {
        let mut parts = line.splitn(2, ' ');
        let command = parts.next().unwrap_or("").to_lowercase();
        let rest = parts.next().unwrap_or("").trim();

        match command.as_str() {
            "" => Ok(()),
            "start" => self.run_tour_command(TourCommand::Start).await,
            "pause" => self.run_tour_command(TourCommand::Pause).await,
            "continue" => self.run_tour_command(TourCommand::Continue).await,
            "next" => self.run_tour_command(TourCommand::Next).await,
            "prev" => self.run_tour_command(TourCommand::Prev).await,
            "reset" => self.run_tour_command(TourCommand::Reset).await,
            "jump" => {
                let idx: i64 = rest.parse().unwrap_or(0);
                self.run_tour_command(TourCommand::JumpTo(idx)).await
            }
            "ask" => self.run_ask(rest).await,
            "quit" | "exit" => Ok(()),
            other => {
                tracing::warn!(command = other, "unrecognised command");
                Ok(())
            }
        }
    }

    async fn run_tour_command(&self, command: TourCommand) -> eyre::Result<()> {
        let stop_count = 1; // single-stop fallback until a tour plan has been loaded via `/api/tour/plan`.
        let continuous = self.system.persistence.lock().await.state().continuous_tour;
        let outcome = self.system.tour_controller.apply(command, stop_count).await;
        tracing::info!(?outcome, "tour command applied");

        match outcome {
            TourControllerOutcome::FreshAsk { stop_index } => {
                if matches!(command, TourCommand::Start) && continuous {
                    self.system.tour_pipeline.start_continuous_tour(stop_index).await;
                }
                self.drive_tour_stop(stop_index, tour_command_turn_kind(command), stop_count, continuous).await?;
            }
            TourControllerOutcome::TourStopResumed { stop_index } => {
                if continuous {
                    self.schedule_next_stop_prefetch(stop_index, stop_count);
                }
            }
            TourControllerOutcome::Resumed | TourControllerOutcome::Paused | TourControllerOutcome::Reset => {}
        }
        Ok(())
    }

    /// Drive one tour-stop turn: replay a cached prefetch entry if continuous mode already
    /// warmed one up for `stop_index`, otherwise issue a fresh AskDriver call whose done-handler
    /// (§4.4) chains the next-stop prefetch. Mirrors `drive_ask`'s reset/drive/drain shape.
    async fn drive_tour_stop(&self, stop_index: i64, kind: TurnKind, stop_count: i64, continuous: bool) -> eyre::Result<()> {
        let guide = Some(GuideParams { continuous, ..Default::default() });
        let request_id = format!("tour-{stop_index}-{}", uuid_like());
        self.system.tts_queue.reset_for_run(request_id.clone()).await;
        self.system.run_coordinator.set_active_run(true).await;

        let replayed = continuous && self.system.tour_pipeline.replay_prefetch_to_queue(stop_index, &self.system.tts_queue).await;

        let outcome: Result<AskOutcome, tour_system::error::AskError> = if replayed {
            self.system.tts_queue.wait_for_idle().await;
            Ok(AskOutcome::default())
        } else {
            let request = TurnRequest {
                request_id,
                kind,
                stop_index: Some(stop_index),
                question_text: format!("stop {stop_index}"),
                guide,
            };
            let cancel = tokio_util::sync::CancellationToken::new();
            self.system
                .ask_driver
                .drive(&request, &self.system.tts_queue, cancel, self.tour_stop_done_hook(continuous, stop_count))
                .await
        };

        self.system.run_coordinator.set_active_run(false).await;
        let outcome = outcome?;
        println!("{}", outcome.full_answer);

        if let Some(next) = self.system.run_coordinator.maybe_start_next_queued().await {
            return self.drive_ask(next).await;
        }
        Ok(())
    }

    /// §4.6 step 4: after a tour-stop resume drains, schedule a prefetch for `stop_index + 1` so
    /// the next automatic transition stays seamless.
    fn schedule_next_stop_prefetch(&self, stop_index: i64, stop_count: i64) {
        let tour_pipeline = self.system.tour_pipeline.clone();
        let ask_driver = self.system.ask_driver.clone();
        tokio::spawn(async move {
            tour_pipeline.set_current_stop_index(stop_index).await;
            prefetch_next_stop(tour_pipeline, ask_driver, stop_index, stop_count).await;
        });
    }

    async fn run_ask(&self, text: &str) -> eyre::Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        let guide_enabled = self.system.persistence.lock().await.state().guide_enabled;
        let request = self.build_ask_request(text);

        let outcome = self
            .system
            .run_coordinator
            .submit(request, "local".to_string(), tour_system::data::Priority::Normal, false, None, guide_enabled)
            .await;

        match outcome {
            SubmitOutcome::Rejected(reason) => {
                tracing::warn!(?reason, "question rejected");
                Ok(())
            }
            SubmitOutcome::TourCommandHandled(command) => self.run_tour_command(command).await,
            SubmitOutcome::Enqueued => {
                tracing::info!("question queued (group mode, run already active)");
                Ok(())
            }
            SubmitOutcome::RunNow(request) => self.drive_ask(request).await,
        }
    }

    /// Drive `request`, then keep draining whatever group-mode queued next until the queue is
    /// empty (§4.7: "whenever the run becomes idle, pick the next queued item").
    async fn drive_ask(&self, request: TurnRequest) -> eyre::Result<()> {
        let mut next = Some(request);
        while let Some(request) = next.take() {
            let continuous = request.guide.as_ref().map(|g| g.continuous).unwrap_or(false);
            self.system.tts_queue.reset_for_run(request.request_id.clone()).await;
            self.system.run_coordinator.set_active_run(true).await;
            let cancel = tokio_util::sync::CancellationToken::new();
            let outcome = self
                .system
                .ask_driver
                .drive(&request, &self.system.tts_queue, cancel, self.tour_stop_done_hook(continuous, 1))
                .await;
            self.system.run_coordinator.set_active_run(false).await;
            let outcome = outcome?;

            println!("{}", outcome.full_answer);
            next = self.system.run_coordinator.maybe_start_next_queued().await;
        }
        Ok(())
    }

    /// Build the `on_tour_stop_done` callback AskDriver fires when a tour-stop answer's stream
    /// finishes (§4.4): when continuous mode is on, it anchors the pipeline at the new stop and
    /// chains a prefetch for `stop_index + 1`. A no-op for plain user questions, since those never
    /// carry a `stop_index`.
    fn tour_stop_done_hook(&self, continuous: bool, stop_count: i64) -> impl Fn(i64) + Send + Sync + 'static {
        let tour_pipeline = self.system.tour_pipeline.clone();
        let ask_driver = self.system.ask_driver.clone();
        move |stop_index: i64| {
            if !continuous {
                return;
            }
            let tour_pipeline = tour_pipeline.clone();
            let ask_driver = ask_driver.clone();
            tokio::spawn(async move {
                tour_pipeline.set_current_stop_index(stop_index).await;
                prefetch_next_stop(tour_pipeline, ask_driver, stop_index, stop_count).await;
            });
        }
    }

    fn build_ask_request(&self, text: &str) -> TurnRequest {
        TurnRequest {
            request_id: format!("ask-{}", uuid_like()),
            kind: TurnKind::UserQuestion,
            stop_index: None,
            question_text: text.to_string(),
            guide: Some(GuideParams::default()),
        }
    }

    /// One-shot entry point for `tour_cli start`: runs a single tour command and returns
    /// without entering the interactive stdin loop.
    pub async fn run_one_shot_start(&self) -> eyre::Result<()> {
        self.run_tour_command(TourCommand::Start).await
    }

    /// One-shot entry point for `tour_cli ask <text>`: drives a single turn and prints the
    /// answer, without entering the interactive stdin loop.
    pub async fn run_one_shot_ask(&self, text: &str) -> eyre::Result<()> {
        self.run_ask(text).await
    }

    /// One-shot entry point for `tour_cli health`: prints the remote server's health status.
    pub async fn run_one_shot_health(&self) -> eyre::Result<()> {
        let health = self.system.api.health().await?;
        println!("{health:?}");
        Ok(())
    }
}

fn uuid_like() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 8];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn tour_command_turn_kind(command: TourCommand) -> TurnKind {
    match command {
        TourCommand::Start => TurnKind::TourStart,
        TourCommand::Continue => TurnKind::TourContinue,
        TourCommand::Next => TurnKind::TourNext,
        TourCommand::Prev => TurnKind::TourPrev,
        TourCommand::JumpTo(_) => TurnKind::TourJump,
        // Pause/Reset never produce a `FreshAsk` outcome, so this arm is unreachable in practice.
        TourCommand::Pause | TourCommand::Reset => TurnKind::UserQuestion,
    }
}

/// TourPipeline's chained next-stop prefetch (§4.4): runs an `ask_prefetch` turn for
/// `stop_index + 1` through AskDriver and, on success, caches the result for replay when the
/// tour actually transitions there.
async fn prefetch_next_stop(tour_pipeline: Arc<TourPipeline>, ask_driver: Arc<tour_system::ask_driver::AskDriver>, stop_index: i64, stop_count: i64) {
    tour_pipeline
        .maybe_prefetch_next_stop(stop_index, Some(stop_count), move |target| async move {
            match ask_driver.prefetch(target, "", Some(GuideParams { continuous: true, ..Default::default() }), format!("prefetch-{target}")).await {
                Ok(entry) => Some(entry),
                Err(err) => {
                    tracing::warn!(?err, stop_index = target, "tour stop prefetch failed");
                    None
                }
            }
        })
        .await;
}
