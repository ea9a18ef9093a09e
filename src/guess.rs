//! Guess evaluation and per-round attempt history.

use serde::{Deserialize, Serialize};

use crate::error::GuessError;

/// What the guesser has to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    /// The guess was below the target.
    Higher,
    /// The guess was above the target.
    Lower,
    Correct,
}

/// Classifies `value` against `target`.
pub fn evaluate(value: i32, target: i32) -> Direction {
    match value.cmp(&target) {
        std::cmp::Ordering::Less => Direction::Higher,
        std::cmp::Ordering::Greater => Direction::Lower,
        std::cmp::Ordering::Equal => Direction::Correct,
    }
}

/// Parses one guess as typed by the player.
pub fn parse_guess(input: &str) -> Result<i32, GuessError> {
    input.trim().parse().map_err(|_| GuessError::NotANumber)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuessRecord {
    pub value: i32,
    pub direction: Direction,
    /// Excluded from the scored attempt count.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub free_attempt: bool,
}

/// Result of a guess that made it into the history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    pub record: GuessRecord,
    /// Scored attempts, set only on the guess that solved the round.
    pub finished: Option<u32>,
}

/// Guesses made by this client in the current round.
#[derive(Debug, Clone, Default)]
pub struct GuessHistory {
    records: Vec<GuessRecord>,
    /// Every fourth guess is free.
    overclock: bool,
    solved: bool,
}

impl GuessHistory {
    pub fn new(overclock: bool) -> Self {
        Self {
            records: Vec::new(),
            overclock,
            solved: false,
        }
    }

    /// Checks `value` against `target` and records it.
    ///
    /// Duplicates and guesses after the round was solved are rejected
    /// without touching the history.
    pub fn submit(&mut self, value: i32, target: i32) -> Result<Submission, GuessError> {
        if self.solved {
            return Err(GuessError::RoundOver);
        }
        if self.contains(value) {
            return Err(GuessError::AlreadyGuessed(value));
        }

        let position = self.records.len() + 1;
        let record = GuessRecord {
            value,
            direction: evaluate(value, target),
            free_attempt: self.overclock && position % 4 == 0,
        };
        self.records.push(record);

        let finished = if record.direction == Direction::Correct {
            self.solved = true;
            Some(self.scored_attempts())
        } else {
            None
        };
        Ok(Submission { record, finished })
    }

    pub fn contains(&self, value: i32) -> bool {
        self.records.iter().any(|r| r.value == value)
    }

    pub fn scored_attempts(&self) -> u32 {
        self.records.iter().filter(|r| !r.free_attempt).count() as u32
    }

    pub fn records(&self) -> &[GuessRecord] {
        &self.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_names_what_to_do_next() {
        assert_eq!(evaluate(10, 50), Direction::Higher);
        assert_eq!(evaluate(90, 50), Direction::Lower);
        assert_eq!(evaluate(50, 50), Direction::Correct);
        for v in -5..120 {
            let d = evaluate(v, 42);
            assert_eq!(d == Direction::Correct, v == 42);
            assert_eq!(d == Direction::Higher, v < 42);
            assert_eq!(d == Direction::Lower, v > 42);
        }
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!(parse_guess(" 42 "), Ok(42));
        assert_eq!(parse_guess("4x2"), Err(GuessError::NotANumber));
        assert_eq!(parse_guess(""), Err(GuessError::NotANumber));
    }

    #[test]
    fn duplicate_does_not_grow_history() {
        let mut history = GuessHistory::new(false);
        history.submit(30, 50).unwrap();
        assert_eq!(history.submit(30, 50), Err(GuessError::AlreadyGuessed(30)));
        assert_eq!(history.records().len(), 1);
    }

    #[test]
    fn finishes_once_on_first_correct() {
        let mut history = GuessHistory::new(false);
        assert_eq!(history.submit(30, 50).unwrap().finished, None);
        assert_eq!(history.submit(70, 50).unwrap().finished, None);
        let hit = history.submit(50, 50).unwrap();
        assert_eq!(hit.finished, Some(3));
        assert_eq!(hit.record.direction, Direction::Correct);
        assert_eq!(history.submit(51, 50), Err(GuessError::RoundOver));
        assert_eq!(history.records().len(), 3);
    }

    #[test]
    fn overclock_marks_every_fourth_position() {
        let mut history = GuessHistory::new(true);
        for value in 1..=9 {
            history.submit(value, 100).unwrap();
        }
        for (i, record) in history.records().iter().enumerate() {
            assert_eq!(record.free_attempt, (i + 1) % 4 == 0, "position {}", i + 1);
        }
        assert_eq!(history.scored_attempts(), 7);
    }

    #[test]
    fn overclock_finish_reports_scored_count() {
        let mut history = GuessHistory::new(true);
        for value in [10, 20, 30] {
            history.submit(value, 40).unwrap();
        }
        // Fourth guess is free, so the round ends on three scored attempts.
        let hit = history.submit(40, 40).unwrap();
        assert!(hit.record.free_attempt);
        assert_eq!(hit.finished, Some(3));
    }
}
