//! Voice-command fast-path parser (§4.7 step 2): a cheap keyword matcher that lets a spoken
//! phrase like "下一站" short-circuit straight to a [`TourCommand`] instead of round-tripping
//! through the remote answer model. Grounded on the same "small fixed keyword table, longest
//! match wins" shape as `compress_tail`'s transition-phrase stripping in
//! [`crate::tour_pipeline`] — this is the analogous table for whole-utterance intents rather
//! than mid-sentence phrases.

use crate::tour_controller::TourCommand;

/// Minimum confidence [`RunCoordinator`](crate::run_coordinator::RunCoordinator) requires before
/// treating a match as authoritative (§4.7 step 2).
pub const CONFIDENCE_THRESHOLD: f32 = 0.75;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedTourCommand {
    pub command: TourCommand,
    pub confidence_milli: u32,
}

impl ParsedTourCommand {
    pub fn confidence(&self) -> f32 {
        self.confidence_milli as f32 / 1000.0
    }
}

/// Exact-phrase entries are high-confidence; loose substring matches are lower-confidence so a
/// question that merely mentions a keyword in passing doesn't get misrouted.
const EXACT_PHRASES: &[(&[&str], TourCommand)] = &[
    (&["开始导览", "开始讲解", "start the tour", "start tour"], TourCommand::Start),
    (&["暂停", "暂停一下", "pause", "stop talking"], TourCommand::Pause),
    (&["继续", "继续讲解", "continue", "resume"], TourCommand::Continue),
    (&["下一站", "下一个", "next stop", "next"], TourCommand::Next),
    (&["上一站", "上一个", "previous stop", "go back"], TourCommand::Prev),
    (&["重新开始", "重置", "reset the tour", "reset"], TourCommand::Reset),
];

/// Parse `text` for a tour voice-command, independent of the confidence gate — callers compare
/// [`ParsedTourCommand::confidence`] against [`CONFIDENCE_THRESHOLD`] themselves.
pub fn parse(text: &str) -> Option<ParsedTourCommand> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lower = trimmed.to_lowercase();

    if let Some(command) = parse_jump(&lower) {
        return Some(ParsedTourCommand {
            command,
            confidence_milli: 900,
        });
    }

    for (phrases, command) in EXACT_PHRASES {
        for phrase in *phrases {
            if lower == *phrase {
                return Some(ParsedTourCommand {
                    command: *command,
                    confidence_milli: 950,
                });
            }
        }
    }

    // A looser substring match still counts, but at reduced confidence — this is what lets the
    // 0.75 threshold matter instead of being a dead gate.
    for (phrases, command) in EXACT_PHRASES {
        for phrase in *phrases {
            if lower.contains(phrase) {
                return Some(ParsedTourCommand {
                    command: *command,
                    confidence_milli: 700,
                });
            }
        }
    }

    None
}

/// Recognise "跳到第N站" / "jump to stop N" and extract the zero-based stop index.
fn parse_jump(lower: &str) -> Option<TourCommand> {
    if let Some(rest) = lower.strip_prefix("跳到第") {
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        let ordinal: i64 = digits.parse().ok()?;
        return Some(TourCommand::JumpTo((ordinal - 1).max(0)));
    }
    if let Some(rest) = lower.strip_prefix("jump to stop ") {
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        let ordinal: i64 = digits.parse().ok()?;
        return Some(TourCommand::JumpTo((ordinal - 1).max(0)));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_phrase_is_high_confidence() {
        let parsed = parse("下一站").unwrap();
        assert_eq!(parsed.command, TourCommand::Next);
        assert!(parsed.confidence() >= CONFIDENCE_THRESHOLD);
    }

    #[test]
    fn unrelated_question_does_not_match() {
        assert!(parse("这个展品是什么年代的？").is_none());
    }

    #[test]
    fn jump_to_stop_extracts_zero_based_index() {
        let parsed = parse("跳到第3站").unwrap();
        assert_eq!(parsed.command, TourCommand::JumpTo(2));
    }

    #[test]
    fn english_jump_phrase_also_parses() {
        let parsed = parse("jump to stop 5").unwrap();
        assert_eq!(parsed.command, TourCommand::JumpTo(4));
    }

    #[test]
    fn substring_match_is_below_exact_confidence_but_still_above_threshold() {
        let parsed = parse("请帮我暂停吧").unwrap();
        assert_eq!(parsed.command, TourCommand::Pause);
        assert!(parsed.confidence() < 0.95);
    }
}
