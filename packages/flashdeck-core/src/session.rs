/// Session state: the single owner of cache, working set, filter,
/// navigator and batch selection.
///
/// All mutation goes through `Session` methods (navigation here, edits in
/// `edit.rs`), so the whole state machine can be driven without a UI.
use std::collections::BTreeSet;

use serde::Serialize;

use crate::cache::SheetCache;
use crate::filter::LevelFilter;
use crate::navigator::Navigator;
use crate::types::{Card, SheetKey};
use crate::working_set::WorkingSet;

/// What the view layer should draw.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum DeckView {
    /// No sheet has been activated yet.
    NoSheet,
    /// The active sheet has no cards at all.
    Empty { key: SheetKey },
    /// Cards exist but the level filter hides all of them.
    NoneVisible { key: SheetKey, total: usize },
    Card(CardView),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CardView {
    pub key: SheetKey,
    pub position: usize,
    pub card: Card,
    pub flipped: bool,
    /// 1-based rank within the visible cards
    pub rank: usize,
    pub visible_total: usize,
    pub total: usize,
    pub dirty: bool,
    pub batch_mode: bool,
    pub selected: bool,
}

impl CardView {
    /// "rank / visible_total", as shown under the card.
    pub fn counter(&self) -> String {
        format!("{} / {}", self.rank, self.visible_total)
    }

    pub fn slider_max(&self) -> usize {
        self.visible_total.saturating_sub(1)
    }

    /// Text on the face currently shown.
    pub fn face(&self) -> &str {
        if self.flipped {
            &self.card.back
        } else {
            &self.card.front
        }
    }
}

#[derive(Debug, Default)]
pub struct Session {
    pub(crate) cache: SheetCache,
    pub(crate) working: Option<WorkingSet>,
    pub(crate) filter: LevelFilter,
    pub(crate) nav: Navigator,
    /// `Some` while batch mode is on.
    pub(crate) selection: Option<BTreeSet<usize>>,
    /// Sequence number of the most recent load request, for stale-response detection.
    pub(crate) load_seq: u64,
    /// Highest revision handed out so far; a new working set starts above it
    /// so a save snapshot never matches a later activation of the same key.
    pub(crate) revision_floor: u64,
}

/// How a confirmed save landed in the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SaveApplied {
    /// The working set matches what the server now holds.
    Clean,
    /// The sheet was edited after the snapshot; those edits are still unsaved.
    EditedSince,
    /// Another sheet is active; only the saved sheet's cache entry moved.
    Inactive,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(filter: LevelFilter) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }

    pub fn cache(&self) -> &SheetCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut SheetCache {
        &mut self.cache
    }

    pub fn working(&self) -> Option<&WorkingSet> {
        self.working.as_ref()
    }

    pub fn active_key(&self) -> Option<&SheetKey> {
        self.working.as_ref().map(|ws| &ws.key)
    }

    pub fn is_active(&self, key: &SheetKey) -> bool {
        self.active_key() == Some(key)
    }

    pub fn is_dirty(&self) -> bool {
        self.working.as_ref().map_or(false, |ws| ws.dirty)
    }

    pub fn cards(&self) -> &[Card] {
        self.working.as_ref().map_or(&[], |ws| ws.cards.as_slice())
    }

    pub fn filter(&self) -> &LevelFilter {
        &self.filter
    }

    pub fn current_position(&self) -> Option<usize> {
        self.nav.current()
    }

    pub fn current_card(&self) -> Option<&Card> {
        self.nav.current().and_then(|p| self.cards().get(p))
    }

    pub fn visible(&self) -> Vec<usize> {
        self.filter.visible(self.cards())
    }

    /// Make `key` the working set from its cached copy. Returns false on a cache miss.
    pub fn activate(&mut self, key: &SheetKey) -> bool {
        let Some(cards) = self.cache.get(key) else {
            return false;
        };
        log::debug!("[flashdeck.session] Activating sheet {} ({} cards)", key, cards.len());
        if let Some(ws) = &self.working {
            self.revision_floor = self.revision_floor.max(ws.revision);
        }
        self.revision_floor += 1;
        let mut ws = WorkingSet::new(key.clone(), cards);
        ws.revision = self.revision_floor;
        self.working = Some(ws);
        self.selection = None;
        self.nav.set_current(None);
        self.reanchor();
        true
    }

    /// Store freshly fetched cards for `key` and activate them.
    pub fn install(&mut self, key: &SheetKey, cards: &[Card]) {
        self.cache.put(key, cards);
        self.activate(key);
    }

    /// Copy the working set into the cache under the active key.
    pub fn commit_to_cache(&mut self) {
        if let Some(ws) = &self.working {
            self.cache.commit(&ws.key, &ws.cards);
        }
    }

    /// Drop unsaved edits of the active sheet and return to its last synced state.
    /// Returns false when there was nothing to discard.
    pub fn discard_changes(&mut self) -> bool {
        let Some(ws) = self.working.as_mut() else {
            return false;
        };
        if !ws.dirty {
            return false;
        }
        self.cache.rollback(&ws.key);
        ws.cards = self.cache.get(&ws.key).unwrap_or_default();
        ws.dirty = false;
        ws.revision += 1;
        log::info!("[flashdeck.session] Discarded unsaved edits on sheet {}", ws.key);
        self.selection = None;
        self.reanchor();
        true
    }

    /// Apply a confirmed save of `snapshot` taken at `revision` for `key`.
    ///
    /// The synced snapshot for `key` is always updated. An active working set
    /// with no edits since the snapshot becomes clean. One that was reset
    /// while the save ran (discard, re-activation) takes the snapshot, since
    /// that is what the server now holds.
    pub fn mark_saved(&mut self, key: &SheetKey, revision: u64, snapshot: &[Card]) -> SaveApplied {
        self.cache.mark_synced(key, snapshot);
        let applied = match self.working.as_mut() {
            Some(ws) if ws.key == *key => {
                if ws.revision == revision {
                    ws.dirty = false;
                    SaveApplied::Clean
                } else if !ws.dirty {
                    log::info!(
                        "[flashdeck.session] Sheet {} was reset during save, taking the saved rows",
                        key
                    );
                    ws.cards = snapshot.to_vec();
                    SaveApplied::Clean
                } else {
                    log::info!(
                        "[flashdeck.session] Sheet {} edited during save, keeping dirty",
                        key
                    );
                    SaveApplied::EditedSince
                }
            }
            _ => {
                // Not active anymore: the server now holds the snapshot.
                self.cache.commit(key, snapshot);
                return SaveApplied::Inactive;
            }
        };
        self.commit_to_cache();
        if applied == SaveApplied::Clean {
            self.reanchor();
        }
        applied
    }

    /// Re-derive visibility and keep the navigator on a visible card.
    pub(crate) fn reanchor(&mut self) {
        let visible = self.visible();
        self.nav.reanchor(&visible);
    }

    // --- filter ---

    pub fn set_levels(&mut self, levels: impl IntoIterator<Item = i64>) {
        self.filter.set_all(levels);
        self.reanchor();
    }

    pub fn toggle_level(&mut self, level: i64) -> bool {
        let on = self.filter.toggle(level);
        self.reanchor();
        on
    }

    // --- navigation ---

    pub fn next(&mut self) {
        let visible = self.visible();
        self.nav.next(&visible);
    }

    pub fn prev(&mut self) {
        let visible = self.visible();
        self.nav.prev(&visible);
    }

    /// Slider jump using a 0-based visible rank.
    pub fn jump_to_visible_rank(&mut self, rank: usize) {
        let visible = self.visible();
        self.nav.jump_to_visible_rank(&visible, rank);
    }

    /// Toggle front/back of the current card. No-op without a current card.
    pub fn flip(&mut self) -> bool {
        if self.current_card().is_none() {
            return false;
        }
        self.nav.flip()
    }

    pub fn view(&self) -> DeckView {
        let Some(ws) = &self.working else {
            return DeckView::NoSheet;
        };
        if ws.cards.is_empty() {
            return DeckView::Empty { key: ws.key.clone() };
        }
        let visible = self.visible();
        let current = self
            .nav
            .rank(&visible)
            .and_then(|rank| self.nav.current().map(|pos| (rank, pos)));
        match current {
            Some((rank, position)) => DeckView::Card(CardView {
                key: ws.key.clone(),
                position,
                card: ws.cards[position].clone(),
                flipped: self.nav.is_flipped(),
                rank: rank + 1,
                visible_total: visible.len(),
                total: ws.cards.len(),
                dirty: ws.dirty,
                batch_mode: self.selection.is_some(),
                selected: self
                    .selection
                    .as_ref()
                    .map_or(false, |s| s.contains(&position)),
            }),
            None => DeckView::NoneVisible {
                key: ws.key.clone(),
                total: ws.cards.len(),
            },
        }
    }
}
