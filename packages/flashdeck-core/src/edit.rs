/// Edit engine: single-card and batch mutations of the working set.
///
/// Every successful mutation marks the working set dirty, commits it to the
/// cache, and re-anchors the navigator. Structural mutations (add/delete)
/// renumber all ids first; level-only mutations leave ids alone.
use std::collections::BTreeSet;

use crate::session::Session;
use crate::types::{is_valid_level, renumber, Card, Confirmation, Notice};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EditError {
    #[error("No sheet is active")]
    NoActiveSheet,

    #[error("Card position {index} out of range (0-{max})")]
    PositionOutOfRange { index: usize, max: usize },

    #[error("No card is shown")]
    NoCurrentCard,

    #[error("Level {0} out of range (1-5)")]
    LevelOutOfRange(i64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOutcome {
    Added { position: usize },
    Updated { count: usize },
    Deleted { count: usize },
    /// Input was empty; nothing changed.
    Ignored,
    /// The user declined the confirmation; nothing changed.
    Cancelled,
    /// A batch action ran with no valid targets.
    NothingSelected,
}

impl EditOutcome {
    pub fn notice(&self) -> Notice {
        match self {
            EditOutcome::Added { position } => Notice::info(format!("Added card #{}", position + 1)),
            EditOutcome::Updated { count: 1 } => Notice::info("Card updated"),
            EditOutcome::Updated { count } => Notice::info(format!("{} cards updated", count)),
            EditOutcome::Deleted { count: 1 } => Notice::info("Card deleted"),
            EditOutcome::Deleted { count } => Notice::info(format!("{} cards deleted", count)),
            EditOutcome::Ignored => Notice::info("Front and back are empty, nothing added"),
            EditOutcome::Cancelled => Notice::info("Cancelled"),
            EditOutcome::NothingSelected => Notice::info("Nothing selected"),
        }
    }
}

fn check_level(level: i64) -> Result<(), EditError> {
    if is_valid_level(level) {
        Ok(())
    } else {
        Err(EditError::LevelOutOfRange(level))
    }
}

impl Session {
    fn check_position(&self, position: usize) -> Result<(), EditError> {
        let ws = self.working.as_ref().ok_or(EditError::NoActiveSheet)?;
        if position < ws.cards.len() {
            Ok(())
        } else {
            Err(EditError::PositionOutOfRange {
                index: position,
                max: ws.cards.len().saturating_sub(1),
            })
        }
    }

    fn cards_mut(&mut self) -> Result<&mut Vec<Card>, EditError> {
        self.working
            .as_mut()
            .map(|ws| &mut ws.cards)
            .ok_or(EditError::NoActiveSheet)
    }

    /// Bookkeeping shared by every successful mutation.
    fn after_mutation(&mut self, structural: bool) {
        if let Some(ws) = self.working.as_mut() {
            if structural {
                renumber(&mut ws.cards);
            }
            ws.touch();
        }
        self.commit_to_cache();
        self.reanchor();
    }

    /// Keep valid targets only, ascending.
    fn valid_targets(&self, targets: &BTreeSet<usize>) -> Vec<usize> {
        let len = self.cards().len();
        targets.iter().copied().filter(|&p| p < len).collect()
    }

    pub fn set_level(&mut self, position: usize, level: i64) -> Result<EditOutcome, EditError> {
        self.check_position(position)?;
        check_level(level)?;
        self.cards_mut()?[position].level = level;
        self.after_mutation(false);
        Ok(EditOutcome::Updated { count: 1 })
    }

    /// Level of the card currently shown.
    pub fn set_current_level(&mut self, level: i64) -> Result<EditOutcome, EditError> {
        let position = self.current_or_err()?;
        self.set_level(position, level)
    }

    pub fn add_card(&mut self, front: &str, back: &str, level: i64) -> Result<EditOutcome, EditError> {
        if self.working.is_none() {
            return Err(EditError::NoActiveSheet);
        }
        let front = front.trim();
        let back = back.trim();
        if front.is_empty() && back.is_empty() {
            return Ok(EditOutcome::Ignored);
        }
        check_level(level)?;

        let cards = self.cards_mut()?;
        let position = cards.len();
        cards.push(Card::new(position + 1, front, back, level));
        self.nav.set_current(Some(position));
        self.after_mutation(true);
        log::debug!("[flashdeck.edit] Added card at position {}", position);
        Ok(EditOutcome::Added { position })
    }

    pub fn edit_card(
        &mut self,
        position: usize,
        front: &str,
        back: &str,
        level: i64,
    ) -> Result<EditOutcome, EditError> {
        self.check_position(position)?;
        check_level(level)?;
        let card = &mut self.cards_mut()?[position];
        card.front = front.trim().to_string();
        card.back = back.trim().to_string();
        card.level = level;
        self.after_mutation(false);
        Ok(EditOutcome::Updated { count: 1 })
    }

    pub fn edit_current(&mut self, front: &str, back: &str, level: i64) -> Result<EditOutcome, EditError> {
        let position = self.current_or_err()?;
        self.edit_card(position, front, back, level)
    }

    pub fn delete_card(
        &mut self,
        position: usize,
        confirmation: Confirmation,
    ) -> Result<EditOutcome, EditError> {
        self.check_position(position)?;
        if confirmation == Confirmation::Declined {
            return Ok(EditOutcome::Cancelled);
        }
        self.remove_positions(&[position])?;
        Ok(EditOutcome::Deleted { count: 1 })
    }

    pub fn delete_current(&mut self, confirmation: Confirmation) -> Result<EditOutcome, EditError> {
        let position = self.current_or_err()?;
        self.delete_card(position, confirmation)
    }

    /// Remove `positions` (ascending, all valid) and fix up the current position.
    fn remove_positions(&mut self, positions: &[usize]) -> Result<(), EditError> {
        let current = self.nav.current();
        let cards = self.cards_mut()?;
        for &p in positions.iter().rev() {
            cards.remove(p);
        }
        let len = cards.len();

        // Keep pointing at the same card when earlier cards disappear, then clamp.
        let remapped = current.and_then(|c| {
            if len == 0 {
                return None;
            }
            let removed_before = positions.iter().filter(|&&p| p < c).count();
            Some((c - removed_before).min(len - 1))
        });
        self.nav.set_current(remapped);
        if let Some(selection) = self.selection.as_mut() {
            selection.clear();
        }
        self.after_mutation(true);
        Ok(())
    }

    // --- batch mode ---

    pub fn batch_mode(&self) -> bool {
        self.selection.is_some()
    }

    pub fn enter_batch_mode(&mut self) {
        if self.selection.is_none() {
            self.selection = Some(BTreeSet::new());
        }
    }

    pub fn exit_batch_mode(&mut self) {
        self.selection = None;
    }

    pub fn selection(&self) -> BTreeSet<usize> {
        self.selection.clone().unwrap_or_default()
    }

    /// Toggle `position` in the selection; enters batch mode if needed.
    /// Returns whether the position is now selected.
    pub fn toggle_selection(&mut self, position: usize) -> Result<bool, EditError> {
        self.check_position(position)?;
        let selection = self.selection.get_or_insert_with(BTreeSet::new);
        if selection.remove(&position) {
            Ok(false)
        } else {
            selection.insert(position);
            Ok(true)
        }
    }

    /// Select every card that passes the level filter.
    pub fn select_visible(&mut self) -> usize {
        let visible = self.visible();
        let count = visible.len();
        self.selection
            .get_or_insert_with(BTreeSet::new)
            .extend(visible);
        count
    }

    pub fn clear_selection(&mut self) {
        if let Some(selection) = self.selection.as_mut() {
            selection.clear();
        }
    }

    pub fn batch_delete(
        &mut self,
        targets: &BTreeSet<usize>,
        confirmation: Confirmation,
    ) -> Result<EditOutcome, EditError> {
        if self.working.is_none() {
            return Err(EditError::NoActiveSheet);
        }
        let targets = self.valid_targets(targets);
        if targets.is_empty() {
            return Ok(EditOutcome::NothingSelected);
        }
        if confirmation == Confirmation::Declined {
            return Ok(EditOutcome::Cancelled);
        }
        self.remove_positions(&targets)?;
        log::info!("[flashdeck.edit] Batch deleted {} cards", targets.len());
        Ok(EditOutcome::Deleted { count: targets.len() })
    }

    pub fn batch_set_level(
        &mut self,
        targets: &BTreeSet<usize>,
        level: i64,
    ) -> Result<EditOutcome, EditError> {
        if self.working.is_none() {
            return Err(EditError::NoActiveSheet);
        }
        let targets = self.valid_targets(targets);
        if targets.is_empty() {
            return Ok(EditOutcome::NothingSelected);
        }
        check_level(level)?;
        let cards = self.cards_mut()?;
        for &p in &targets {
            cards[p].level = level;
        }
        self.after_mutation(false);
        Ok(EditOutcome::Updated { count: targets.len() })
    }

    /// Delete the current selection. The selection is cleared once the delete commits.
    pub fn delete_selected(&mut self, confirmation: Confirmation) -> Result<EditOutcome, EditError> {
        let targets = self.selection();
        self.batch_delete(&targets, confirmation)
    }

    /// Set the level of the current selection and clear it.
    pub fn set_selected_level(&mut self, level: i64) -> Result<EditOutcome, EditError> {
        let targets = self.selection();
        let outcome = self.batch_set_level(&targets, level)?;
        if matches!(outcome, EditOutcome::Updated { .. }) {
            self.clear_selection();
        }
        Ok(outcome)
    }

    fn current_or_err(&self) -> Result<usize, EditError> {
        if self.working.is_none() {
            return Err(EditError::NoActiveSheet);
        }
        self.nav.current().ok_or(EditError::NoCurrentCard)
    }
}
