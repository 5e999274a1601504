use std::{
    collections::{BTreeSet, HashMap},
    time::Duration,
};

use thiserror::Error;
use tokio::time::Instant;

use crate::{dao::models::Cardinality, state::question::Question};

/// Rejected selection edits.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectionError {
    /// Edits only apply to the question on screen.
    #[error("question {requested} is not displayed (current is {current})")]
    NotDisplayed {
        /// Index the edit targeted.
        requested: usize,
        /// Index currently displayed.
        current: usize,
    },
    /// A choice position beyond the question's choices.
    #[error("choice {choice} does not exist (question has {available} choices)")]
    InvalidChoice {
        /// Offending position.
        choice: usize,
        /// Number of choices.
        available: usize,
    },
}

/// Answer lifted out of the store to become a save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedAnswer {
    /// Question position.
    pub question_index: usize,
    /// Selected choices, ascending.
    pub selected: Vec<usize>,
    /// Accumulated viewing time for the question.
    pub time_spent_seconds: u64,
}

/// View-model holding the selection of the displayed question.
///
/// Selections of questions already visited are remembered so that navigating back restores
/// them; nothing here is persisted.
#[derive(Debug)]
pub struct AnswerStore {
    current: usize,
    selection: BTreeSet<usize>,
    dirty: bool,
    captured: HashMap<usize, BTreeSet<usize>>,
    time_spent: HashMap<usize, Duration>,
    viewing_since: Instant,
}

impl AnswerStore {
    /// Start with question `index` on screen.
    pub fn new(index: usize, now: Instant) -> Self {
        Self {
            current: index,
            selection: BTreeSet::new(),
            dirty: false,
            captured: HashMap::new(),
            time_spent: HashMap::new(),
            viewing_since: now,
        }
    }

    /// Index of the displayed question.
    pub fn current(&self) -> usize {
        self.current
    }

    /// Selection of the displayed question, ascending.
    pub fn selection(&self) -> Vec<usize> {
        self.selection.iter().copied().collect()
    }

    /// Whether question `index` holds a non-empty local selection.
    pub fn is_answered(&self, index: usize) -> bool {
        self.captured
            .get(&index)
            .is_some_and(|selection| !selection.is_empty())
    }

    /// Apply a selection edit to the displayed question.
    ///
    /// Single-select questions keep exactly one choice (the last one given replaces any
    /// previous pick); multi-select questions toggle each given choice.
    pub fn set_selection(
        &mut self,
        question_index: usize,
        choices: &[usize],
        question: &Question,
    ) -> Result<Vec<usize>, SelectionError> {
        if question_index != self.current {
            return Err(SelectionError::NotDisplayed {
                requested: question_index,
                current: self.current,
            });
        }

        let available = question.choices.len();
        if let Some(&choice) = choices.iter().find(|&&choice| choice >= available) {
            return Err(SelectionError::InvalidChoice { choice, available });
        }

        match question.cardinality {
            Cardinality::Single => {
                if let Some(&last) = choices.last() {
                    self.selection.clear();
                    self.selection.insert(last);
                }
            }
            Cardinality::Multiple => {
                for &choice in choices {
                    if !self.selection.remove(&choice) {
                        self.selection.insert(choice);
                    }
                }
            }
        }

        self.dirty = true;
        self.captured.insert(self.current, self.selection.clone());
        Ok(self.selection())
    }

    /// Reset the displayed selection.
    pub fn clear(&mut self) {
        self.selection.clear();
    }

    /// Put question `index` on screen, restoring its previous selection if there is one.
    pub fn open(&mut self, index: usize, now: Instant) {
        self.account_time(now);
        self.current = index;
        self.dirty = false;
        match self.captured.get(&index) {
            Some(previous) => self.selection = previous.clone(),
            None => self.clear(),
        }
    }

    /// The displayed answer if it changed since it was last handed out and is non-empty.
    pub fn take_unsaved(&mut self, now: Instant) -> Option<CapturedAnswer> {
        if !self.dirty || self.selection.is_empty() {
            return None;
        }
        self.dirty = false;
        Some(CapturedAnswer {
            question_index: self.current,
            selected: self.selection(),
            time_spent_seconds: self.time_spent_on(self.current, now).as_secs(),
        })
    }

    /// Accumulated viewing time for `index`, including the ongoing visit.
    pub fn time_spent_on(&self, index: usize, now: Instant) -> Duration {
        let stored = self.time_spent.get(&index).copied().unwrap_or_default();
        if index == self.current {
            stored + now.saturating_duration_since(self.viewing_since)
        } else {
            stored
        }
    }

    fn account_time(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.viewing_since);
        *self.time_spent.entry(self.current).or_default() += elapsed;
        self.viewing_since = now;
    }
}
