//! RunCoordinator (C7): top-level submit/queue/takeover policy, group mode, high-priority
//! preemption, tour-voice command routing.
//!
//! Grounded directly on `GameTts::add_to_queue` / `request_tts_with_channel`
//! (`st_system/src/session/mod.rs`): a normal FIFO lane plus a one-slot priority lane that can
//! demote its previous occupant back onto the FIFO lane. Generalised here to carry
//! [`QueuedQuestion`] instead of `VoiceLine`, with the cooldown/speaker-fairness policy layered
//! on top in [`RunCoordinator::maybe_start_next_queued`].

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::data::{Priority, QueuedQuestion, TurnRequest};
use crate::tour_controller::TourCommand;
use crate::tour_voice_command;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Dispatch this request to AskDriver/TourController immediately.
    RunNow(TurnRequest),
    /// The request was appended to the group-mode queue; nothing to do right now.
    Enqueued,
    /// The request was rejected before queueing.
    Rejected(RejectReason),
    /// The voice-command fast-path matched a tour action with confidence at or above
    /// [`tour_voice_command::CONFIDENCE_THRESHOLD`]; the caller should execute it against
    /// `TourController` and must NOT also dispatch an ask-turn for this text.
    TourCommandHandled(TourCommand),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Empty,
    MissingAgent,
}

struct State {
    active_run: bool,
    last_speaker: Option<String>,
    last_high_priority_interrupt_at: Option<Instant>,
    queue: VecDeque<QueuedQuestion>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            active_run: false,
            last_speaker: None,
            last_high_priority_interrupt_at: None,
            queue: VecDeque::new(),
        }
    }
}

pub struct RunCoordinator {
    state: Mutex<State>,
    group_mode: bool,
    high_priority_cooldown: Duration,
}

impl RunCoordinator {
    pub fn new(group_mode: bool, high_priority_cooldown: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            group_mode,
            high_priority_cooldown,
        }
    }

    pub async fn set_active_run(&self, active: bool) {
        self.state.lock().await.active_run = active;
    }

    /// Submit policy for a user question, §4.7.
    ///
    /// `guide_enabled` gates step 2 (the voice-command fast-path): when the guide is off, a
    /// phrase like "下一站" is just a question like any other.
    pub async fn submit(
        &self,
        request: TurnRequest,
        speaker: String,
        priority: Priority,
        use_agent: bool,
        selected_agent: Option<&str>,
        guide_enabled: bool,
    ) -> SubmitOutcome {
        if request.question_text.trim().is_empty() {
            return SubmitOutcome::Rejected(RejectReason::Empty);
        }
        if use_agent && selected_agent.is_none() {
            return SubmitOutcome::Rejected(RejectReason::MissingAgent);
        }

        if guide_enabled {
            if let Some(parsed) = tour_voice_command::parse(&request.question_text) {
                if parsed.confidence() >= tour_voice_command::CONFIDENCE_THRESHOLD {
                    return SubmitOutcome::TourCommandHandled(parsed.command);
                }
            }
        }

        if !self.group_mode {
            return SubmitOutcome::RunNow(request);
        }

        let mut state = self.state.lock().await;

        if state.active_run && priority == Priority::High {
            let now = Instant::now();
            let on_cooldown = state
                .last_high_priority_interrupt_at
                .map(|t| now.duration_since(t) < self.high_priority_cooldown)
                .unwrap_or(false);

            if on_cooldown {
                state.queue.push_back(QueuedQuestion {
                    request,
                    speaker,
                    priority,
                });
                return SubmitOutcome::Enqueued;
            }

            state.last_high_priority_interrupt_at = Some(now);
            state.last_speaker = Some(speaker);
            return SubmitOutcome::RunNow(request);
        }

        state.queue.push_back(QueuedQuestion {
            request,
            speaker,
            priority,
        });
        SubmitOutcome::Enqueued
    }

    /// Called whenever the current run goes idle; picks the next queued item, preferring a
    /// different speaker from `last_speaker`, and `high` priority over `normal`.
    pub async fn maybe_start_next_queued(&self) -> Option<TurnRequest> {
        let mut state = self.state.lock().await;
        if state.queue.is_empty() {
            return None;
        }

        let last_speaker = state.last_speaker.clone();
        // `max_by_key` keeps the LAST max on ties, which would violate FIFO within a priority/
        // speaker-rank tier; breaking ties on `Reverse(i)` keeps the earliest-enqueued winner.
        let best_idx = state
            .queue
            .iter()
            .enumerate()
            .max_by_key(|(i, q)| {
                let priority_rank = matches!(q.priority, Priority::High) as u8;
                let speaker_rank = last_speaker.as_deref().map(|s| s != q.speaker).unwrap_or(true) as u8;
                (priority_rank, speaker_rank, std::cmp::Reverse(*i))
            })
            .map(|(i, _)| i)?;

        let picked = state.queue.remove(best_idx)?;
        state.last_speaker = Some(picked.speaker.clone());
        Some(picked.request)
    }

    pub async fn queue_len(&self) -> usize {
        self.state.lock().await.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::TurnKind;

    fn req(id: &str) -> TurnRequest {
        TurnRequest {
            request_id: id.into(),
            kind: TurnKind::UserQuestion,
            stop_index: None,
            question_text: "question".into(),
            guide: None,
        }
    }

    #[tokio::test]
    async fn empty_question_is_rejected() {
        let coordinator = RunCoordinator::new(false, Duration::from_secs(4));
        let mut empty = req("r1");
        empty.question_text = "   ".into();
        let outcome = coordinator.submit(empty, "Alice".into(), Priority::Normal, false, None, false).await;
        assert_eq!(outcome, SubmitOutcome::Rejected(RejectReason::Empty));
    }

    #[tokio::test]
    async fn agent_mode_without_agent_is_rejected() {
        let coordinator = RunCoordinator::new(false, Duration::from_secs(4));
        let outcome = coordinator.submit(req("r1"), "Alice".into(), Priority::Normal, true, None, false).await;
        assert_eq!(outcome, SubmitOutcome::Rejected(RejectReason::MissingAgent));
    }

    #[tokio::test]
    async fn non_group_mode_runs_immediately() {
        let coordinator = RunCoordinator::new(false, Duration::from_secs(4));
        let outcome = coordinator.submit(req("r1"), "Alice".into(), Priority::Normal, false, None, false).await;
        assert!(matches!(outcome, SubmitOutcome::RunNow(_)));
    }

    #[tokio::test]
    async fn voice_command_fast_path_preempts_dispatch_when_guide_enabled() {
        let coordinator = RunCoordinator::new(false, Duration::from_secs(4));
        let mut next_stop = req("r1");
        next_stop.question_text = "下一站".into();
        let outcome = coordinator.submit(next_stop, "Alice".into(), Priority::Normal, false, None, true).await;
        assert_eq!(outcome, SubmitOutcome::TourCommandHandled(TourCommand::Next));
    }

    #[tokio::test]
    async fn voice_command_phrase_is_a_plain_question_when_guide_disabled() {
        let coordinator = RunCoordinator::new(false, Duration::from_secs(4));
        let mut next_stop = req("r1");
        next_stop.question_text = "下一站".into();
        let outcome = coordinator.submit(next_stop, "Alice".into(), Priority::Normal, false, None, false).await;
        assert!(matches!(outcome, SubmitOutcome::RunNow(_)));
    }

    #[tokio::test]
    async fn group_mode_queues_when_not_active() {
        let coordinator = RunCoordinator::new(true, Duration::from_secs(4));
        let outcome = coordinator.submit(req("r1"), "Alice".into(), Priority::Normal, false, None, false).await;
        assert_eq!(outcome, SubmitOutcome::Enqueued);
        assert_eq!(coordinator.queue_len().await, 1);
    }

    #[tokio::test]
    async fn high_priority_preempts_active_run_outside_cooldown() {
        let coordinator = RunCoordinator::new(true, Duration::from_secs(4));
        coordinator.set_active_run(true).await;
        let outcome = coordinator.submit(req("r1"), "Bob".into(), Priority::High, false, None, false).await;
        assert!(matches!(outcome, SubmitOutcome::RunNow(_)));
    }

    #[tokio::test]
    async fn high_priority_within_cooldown_is_queued() {
        let coordinator = RunCoordinator::new(true, Duration::from_secs(4));
        coordinator.set_active_run(true).await;
        let _ = coordinator.submit(req("r1"), "Alice".into(), Priority::High, false, None, false).await;
        let second = coordinator.submit(req("r2"), "Alice".into(), Priority::High, false, None, false).await;
        assert_eq!(second, SubmitOutcome::Enqueued);
    }

    #[tokio::test]
    async fn next_queued_prefers_different_speaker_and_high_priority() {
        let coordinator = RunCoordinator::new(true, Duration::from_secs(4));
        coordinator.submit(req("r1"), "Alice".into(), Priority::Normal, false, None, false).await;
        coordinator.submit(req("r2"), "Bob".into(), Priority::Normal, false, None, false).await;
        {
            let mut state = coordinator.state.lock().await;
            state.last_speaker = Some("Alice".into());
        }
        let picked = coordinator.maybe_start_next_queued().await.unwrap();
        assert_eq!(picked.request_id, "r2");
    }

    #[tokio::test]
    async fn next_queued_breaks_ties_in_favor_of_the_earliest_enqueued() {
        let coordinator = RunCoordinator::new(true, Duration::from_secs(4));
        coordinator.submit(req("r1"), "Alice".into(), Priority::Normal, false, None, false).await;
        coordinator.submit(req("r2"), "Bob".into(), Priority::Normal, false, None, false).await;
        coordinator.submit(req("r3"), "Carol".into(), Priority::Normal, false, None, false).await;

        let picked = coordinator.maybe_start_next_queued().await.unwrap();
        assert_eq!(picked.request_id, "r1");
    }
}
