/// The active, mutable copy of one sheet plus its dirty tracking.
use crate::types::{Card, SheetKey, SheetRow};

#[derive(Debug, Clone)]
pub struct WorkingSet {
    pub key: SheetKey,
    pub cards: Vec<Card>,
    /// Set by every mutation, cleared only by a confirmed save or by activation.
    pub dirty: bool,
    /// Monotonic edit counter; a save snapshot is current only if this hasn't moved.
    pub revision: u64,
}

impl WorkingSet {
    pub fn new(key: SheetKey, cards: Vec<Card>) -> Self {
        Self {
            key,
            cards,
            dirty: false,
            revision: 0,
        }
    }

    /// Record a local mutation.
    pub fn touch(&mut self) {
        self.dirty = true;
        self.revision += 1;
    }

    pub fn rows(&self) -> Vec<SheetRow> {
        self.cards.iter().map(Card::to_row).collect()
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }
}
