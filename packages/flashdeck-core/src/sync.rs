/// Sync controller: moves sheets between the remote store, the cache and
/// the working set.
///
/// - preload fans out one fetch per uncached sheet; a failed sheet is
///   cached empty and never aborts the others
/// - load is synchronous on a cache hit; a miss fetches, caches, then
///   activates, unless a newer load was requested meanwhile
/// - save snapshots the working set, sends it, and only marks clean if the
///   saved key is still active and unedited; at most one save per key is
///   in flight, later requests are queued behind it
/// - a switch never activates over unsaved edits under autosave
///
/// The session mutex is never held across an await point.
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::cache::SheetCache;
use crate::config::{SheetCatalog, SwitchPolicy, SyncSettings};
use crate::normalize::normalize_rows;
use crate::remote::{RemoteError, SaveAck, SheetRemote};
use crate::session::{SaveApplied, Session};
use crate::types::{Card, Notice, SheetKey, SheetRow};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Unknown sheet: {0}")]
    UnknownSheet(SheetKey),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SheetLoadState {
    Unloaded,
    Loading,
    Loaded,
}

/// Broadcast to subscribers (e.g. a status line) as sync work completes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum SyncEvent {
    FetchStarted { key: SheetKey },
    SaveStarted { key: SheetKey },
    SheetFetched { key: SheetKey, cards: usize },
    SheetActivated { key: SheetKey },
    FetchFailed { key: SheetKey, message: String },
    Saved { key: SheetKey, cards: usize },
    SaveFailed { key: SheetKey, message: String },
    PreloadFinished { loaded: usize, failed: usize },
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct PreloadReport {
    pub loaded: Vec<SheetKey>,
    pub failed: Vec<(SheetKey, String)>,
    /// Already cached before preload started.
    pub skipped: Vec<SheetKey>,
}

impl PreloadReport {
    pub fn notice(&self) -> Notice {
        if self.failed.is_empty() {
            Notice::info(format!("Preloaded {} sheets", self.loaded.len()))
        } else {
            let keys: Vec<String> = self.failed.iter().map(|(k, _)| k.to_string()).collect();
            Notice::warning(format!(
                "Preloaded {} sheets, failed: {}",
                self.loaded.len(),
                keys.join(", ")
            ))
        }
    }
}

#[derive(Debug)]
pub enum LoadOutcome {
    Activated { key: SheetKey, cards: usize, from_cache: bool },
    /// Fetched and cached, but a newer load won; not activated.
    Superseded { key: SheetKey },
    /// The switch did not happen; the current sheet stays active.
    Blocked { key: SheetKey, reason: Notice },
    Failed { key: SheetKey, error: SyncError },
}

impl LoadOutcome {
    pub fn notice(&self) -> Notice {
        match self {
            LoadOutcome::Activated { key, cards, .. } => {
                Notice::info(format!("Sheet {} ({} cards)", key, cards))
            }
            LoadOutcome::Superseded { key } => {
                Notice::info(format!("Sheet {} loaded in the background", key))
            }
            LoadOutcome::Blocked { key, reason } => Notice::warning(format!(
                "Stayed on current sheet, could not switch to {}: {}",
                key, reason.message
            )),
            LoadOutcome::Failed { key, error } => {
                Notice::error(format!("Failed to load sheet {}: {}", key, error))
            }
        }
    }
}

#[derive(Debug)]
pub enum SaveOutcome {
    /// The server accepted the rows; `applied` says what that did locally.
    Saved { key: SheetKey, cards: usize, applied: SaveApplied },
    NothingToSave,
    NoActiveSheet,
    /// Another save for this sheet is in flight; this one runs after it.
    Queued { key: SheetKey },
    /// The server answered with a status we do not recognize.
    Uncertain { key: SheetKey, status: String },
    Failed { key: SheetKey, error: SyncError },
}

impl SaveOutcome {
    pub fn notice(&self) -> Notice {
        match self {
            SaveOutcome::Saved { cards, applied: SaveApplied::Clean, .. } => {
                Notice::info(format!("Saved {} cards", cards))
            }
            SaveOutcome::Saved { cards, applied: SaveApplied::EditedSince, .. } => Notice::info(format!(
                "Saved {} cards; newer edits are still unsaved",
                cards
            )),
            SaveOutcome::Saved { key, cards, applied: SaveApplied::Inactive } => {
                Notice::info(format!("Saved {} cards to sheet {}", cards, key))
            }
            SaveOutcome::NothingToSave => Notice::info("Nothing to save"),
            SaveOutcome::NoActiveSheet => Notice::info("No sheet is open"),
            SaveOutcome::Queued { key } => Notice::info(format!(
                "Save for sheet {} queued; it runs when the current one finishes",
                key
            )),
            SaveOutcome::Uncertain { status, .. } => Notice::warning(format!(
                "Save outcome unknown (server said {:?}); changes kept locally",
                status
            )),
            SaveOutcome::Failed { error, .. } => {
                Notice::error(format!("Save failed: {}; changes kept locally", error))
            }
        }
    }
}

#[derive(Debug)]
pub enum RefetchOutcome {
    Refreshed { key: SheetKey, cards: usize, changed: bool },
    /// The sheet is open with unsaved edits.
    Blocked { key: SheetKey },
    Failed { key: SheetKey, error: SyncError },
}

impl RefetchOutcome {
    pub fn notice(&self) -> Notice {
        match self {
            RefetchOutcome::Refreshed { key, cards, changed: true } => {
                Notice::info(format!("Sheet {} refreshed ({} cards, changed on server)", key, cards))
            }
            RefetchOutcome::Refreshed { key, cards, changed: false } => {
                Notice::info(format!("Sheet {} refreshed ({} cards, unchanged)", key, cards))
            }
            RefetchOutcome::Blocked { key } => {
                Notice::warning(format!("Sheet {} has unsaved changes; save or discard first", key))
            }
            RefetchOutcome::Failed { key, error } => {
                Notice::error(format!("Failed to refresh sheet {}: {}", key, error))
            }
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum DiscardOutcome {
    Discarded { key: SheetKey },
    NothingToDiscard,
    /// A save of this sheet is running; its result decides what is synced.
    SaveInFlight { key: SheetKey },
}

impl DiscardOutcome {
    pub fn notice(&self) -> Notice {
        match self {
            DiscardOutcome::Discarded { key } => {
                Notice::info(format!("Unsaved edits on sheet {} discarded", key))
            }
            DiscardOutcome::NothingToDiscard => Notice::info("Nothing to discard"),
            DiscardOutcome::SaveInFlight { key } => Notice::warning(format!(
                "Sheet {} is being saved; discard after the save finishes",
                key
            )),
        }
    }
}

/// Counts in-flight network operations for the loading indicator.
struct BusyGuard<'a>(&'a AtomicUsize);

impl<'a> BusyGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct SyncController<R: SheetRemote> {
    remote: R,
    catalog: SheetCatalog,
    settings: SyncSettings,
    session: Mutex<Session>,
    load_states: Mutex<HashMap<SheetKey, SheetLoadState>>,
    /// key -> "another save was requested while this one ran"
    saves_in_flight: Mutex<HashMap<SheetKey, bool>>,
    busy: AtomicUsize,
    event_tx: broadcast::Sender<SyncEvent>,
}

impl<R: SheetRemote> SyncController<R> {
    pub fn new(remote: R, catalog: SheetCatalog, settings: SyncSettings) -> Self {
        Self::with_session(remote, catalog, settings, Session::new())
    }

    pub fn with_session(
        remote: R,
        catalog: SheetCatalog,
        settings: SyncSettings,
        session: Session,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            remote,
            catalog,
            settings,
            session: Mutex::new(session),
            load_states: Mutex::new(HashMap::new()),
            saves_in_flight: Mutex::new(HashMap::new()),
            busy: AtomicUsize::new(0),
            event_tx,
        }
    }

    /// Lock the session for reads, navigation and edits.
    /// Do not hold the guard across an await.
    pub fn session(&self) -> MutexGuard<'_, Session> {
        lock(&self.session)
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn catalog(&self) -> &SheetCatalog {
        &self.catalog
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.event_tx.subscribe()
    }

    /// True while any fetch or save is running.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst) > 0
    }

    pub fn load_state(&self, key: &SheetKey) -> SheetLoadState {
        lock(&self.load_states)
            .get(key)
            .copied()
            .unwrap_or(SheetLoadState::Unloaded)
    }

    pub fn save_in_flight(&self, key: &SheetKey) -> bool {
        lock(&self.saves_in_flight).contains_key(key)
    }

    fn set_load_state(&self, key: &SheetKey, state: SheetLoadState) {
        lock(&self.load_states).insert(key.clone(), state);
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.event_tx.send(event);
    }

    fn sheet_name(&self, key: &SheetKey) -> Result<String, SyncError> {
        self.catalog
            .get(key)
            .map(|e| e.sheet.clone())
            .ok_or_else(|| SyncError::UnknownSheet(key.clone()))
    }

    /// Fetch and normalize one sheet. Does not touch the cache.
    async fn fetch_cards(&self, key: &SheetKey) -> Result<Vec<Card>, SyncError> {
        let sheet = self.sheet_name(key)?;
        let previous = self.load_state(key);
        self.set_load_state(key, SheetLoadState::Loading);
        log::info!("[flashdeck.sync] Fetching sheet {} ({})", key, sheet);
        self.emit(SyncEvent::FetchStarted { key: key.clone() });

        let result = {
            let _busy = BusyGuard::new(&self.busy);
            self.remote.fetch_sheet(&sheet).await
        };

        match result {
            Ok(rows) => {
                let cards = normalize_rows(&rows);
                if cards.len() != rows.len() {
                    log::debug!(
                        "[flashdeck.sync] Sheet {}: dropped {} short rows",
                        key,
                        rows.len() - cards.len()
                    );
                }
                self.emit(SyncEvent::SheetFetched {
                    key: key.clone(),
                    cards: cards.len(),
                });
                Ok(cards)
            }
            Err(e) => {
                let restored = match previous {
                    SheetLoadState::Loaded => SheetLoadState::Loaded,
                    _ => SheetLoadState::Unloaded,
                };
                self.set_load_state(key, restored);
                log::warn!("[flashdeck.sync] Failed to fetch sheet {}: {}", key, e);
                self.emit(SyncEvent::FetchFailed {
                    key: key.clone(),
                    message: e.to_string(),
                });
                Err(e.into())
            }
        }
    }

    /// Fetch every catalog sheet that is not cached yet, concurrently.
    /// Never fails: a sheet whose fetch fails is cached as empty.
    pub async fn preload_all(&self) -> PreloadReport {
        let (pending, skipped): (Vec<SheetKey>, Vec<SheetKey>) = {
            let session = self.session();
            self.catalog
                .keys()
                .cloned()
                .partition(|k| !session.cache().has(k))
        };

        let results = join_all(pending.iter().map(|key| async move {
            let result = self.fetch_cards(key).await;
            let mut session = self.session();
            // A concurrent load may have filled this key already; keep its data.
            let cards = match &result {
                Ok(cards) => cards.as_slice(),
                Err(_) => &[],
            };
            if !session.cache().has(key) {
                session.cache_mut().put(key, cards);
            }
            drop(session);
            self.set_load_state(key, SheetLoadState::Loaded);
            (key.clone(), result)
        }))
        .await;

        let mut report = PreloadReport {
            skipped,
            ..PreloadReport::default()
        };
        for (key, result) in results {
            match result {
                Ok(_) => report.loaded.push(key),
                Err(e) => report.failed.push((key, e.to_string())),
            }
        }
        log::info!(
            "[flashdeck.sync] Preload finished: {} loaded, {} failed, {} already cached",
            report.loaded.len(),
            report.failed.len(),
            report.skipped.len()
        );
        self.emit(SyncEvent::PreloadFinished {
            loaded: report.loaded.len(),
            failed: report.failed.len(),
        });
        report
    }

    /// Activate `key`, applying the configured policy to unsaved edits on
    /// the current sheet. On failure the current working set is untouched.
    pub async fn load_set(&self, key: &SheetKey) -> LoadOutcome {
        if self.catalog.get(key).is_none() {
            return LoadOutcome::Failed {
                key: key.clone(),
                error: SyncError::UnknownSheet(key.clone()),
            };
        }

        let needs_autosave = {
            let session = self.session();
            self.settings.switch_policy == SwitchPolicy::Autosave
                && session.is_dirty()
                && !session.is_active(key)
        };
        if needs_autosave {
            let outcome = self.save_all().await;
            if !matches!(outcome, SaveOutcome::Saved { applied: SaveApplied::Clean, .. }) {
                log::warn!(
                    "[flashdeck.sync] Autosave before switching to {} did not complete",
                    key
                );
                return LoadOutcome::Blocked {
                    key: key.clone(),
                    reason: outcome.notice(),
                };
            }
        }

        let seq = {
            let mut session = self.session();
            session.load_seq += 1;

            if session.is_active(key) {
                // Same sheet: keep edits, just go back to the first card.
                session.jump_to_visible_rank(0);
                return LoadOutcome::Activated {
                    key: key.clone(),
                    cards: session.cards().len(),
                    from_cache: true,
                };
            }
            if let Some(blocked) = self.edited_during_switch(&session, key) {
                return blocked;
            }
            if session.cache().has(key) {
                self.activate_locked(&mut session, key);
                return LoadOutcome::Activated {
                    key: key.clone(),
                    cards: session.cards().len(),
                    from_cache: true,
                };
            }
            session.load_seq
        };

        let cards = match self.fetch_cards(key).await {
            Ok(cards) => cards,
            Err(error) => {
                return LoadOutcome::Failed {
                    key: key.clone(),
                    error,
                }
            }
        };

        let mut session = self.session();
        if !session.cache().has(key) {
            session.cache_mut().put(key, &cards);
        }
        self.set_load_state(key, SheetLoadState::Loaded);

        if session.load_seq != seq {
            log::info!(
                "[flashdeck.sync] Sheet {} arrived after a newer load, not activating",
                key
            );
            return LoadOutcome::Superseded { key: key.clone() };
        }
        if let Some(blocked) = self.edited_during_switch(&session, key) {
            return blocked;
        }
        self.activate_locked(&mut session, key);
        LoadOutcome::Activated {
            key: key.clone(),
            cards: session.cards().len(),
            from_cache: false,
        }
    }

    /// Under autosave, edits made while the switch was waiting on the network
    /// keep the current sheet active. The target stays cached for the next try.
    fn edited_during_switch(&self, session: &Session, key: &SheetKey) -> Option<LoadOutcome> {
        if self.settings.switch_policy != SwitchPolicy::Autosave
            || !session.is_dirty()
            || session.is_active(key)
        {
            return None;
        }
        let active = session.active_key()?;
        log::warn!(
            "[flashdeck.sync] Sheet {} edited while switching to {}, staying",
            active,
            key
        );
        Some(LoadOutcome::Blocked {
            key: key.clone(),
            reason: Notice::warning(format!(
                "sheet {} has edits made during the switch; save or discard them first",
                active
            )),
        })
    }

    fn activate_locked(&self, session: &mut Session, key: &SheetKey) {
        if session.is_dirty()
            && !session.is_active(key)
            && self.settings.switch_policy == SwitchPolicy::Discard
        {
            session.discard_changes();
        }
        session.activate(key);
        self.set_load_state(key, SheetLoadState::Loaded);
        self.emit(SyncEvent::SheetActivated { key: key.clone() });
    }

    /// Take a save snapshot of the active sheet and claim its in-flight slot.
    fn begin_save(&self) -> Result<(SheetKey, String, Vec<Card>, u64), SaveOutcome> {
        let session = self.session();
        let ws = session.working().ok_or(SaveOutcome::NoActiveSheet)?;
        if !ws.dirty {
            return Err(SaveOutcome::NothingToSave);
        }
        let key = ws.key.clone();
        let sheet = self.sheet_name(&key).map_err(|error| SaveOutcome::Failed {
            key: key.clone(),
            error,
        })?;

        let mut in_flight = lock(&self.saves_in_flight);
        if let Some(rerun) = in_flight.get_mut(&key) {
            *rerun = true;
            log::info!("[flashdeck.sync] Save for {} already running, queued", key);
            return Err(SaveOutcome::Queued { key });
        }
        in_flight.insert(key.clone(), false);
        Ok((key, sheet, ws.cards.clone(), ws.revision))
    }

    /// Push the active working set to the remote store.
    pub async fn save_all(&self) -> SaveOutcome {
        let (key, sheet, mut snapshot, mut revision) = match self.begin_save() {
            Ok(claim) => claim,
            Err(outcome) => return outcome,
        };

        loop {
            let rows: Vec<SheetRow> = snapshot.iter().map(Card::to_row).collect();
            log::info!("[flashdeck.sync] Saving sheet {} ({} rows)", key, rows.len());
            self.emit(SyncEvent::SaveStarted { key: key.clone() });
            let result = {
                let _busy = BusyGuard::new(&self.busy);
                self.remote.save_sheet(&sheet, &rows).await
            };
            let outcome = self.finish_save(&key, revision, &snapshot, result);

            // Run a queued save if one was requested and there is still something to send,
            // whether or not this attempt went through.
            let session = self.session();
            let mut in_flight = lock(&self.saves_in_flight);
            let rerun = in_flight.get(&key).copied().unwrap_or(false);
            let next = match session.working() {
                Some(ws) if rerun && ws.key == key && ws.dirty => {
                    Some((ws.cards.clone(), ws.revision))
                }
                _ => None,
            };
            match next {
                Some((cards, rev)) => {
                    in_flight.insert(key.clone(), false);
                    snapshot = cards;
                    revision = rev;
                    log::info!("[flashdeck.sync] Running queued save for {}", key);
                }
                None => {
                    in_flight.remove(&key);
                    return outcome;
                }
            }
        }
    }

    fn finish_save(
        &self,
        key: &SheetKey,
        revision: u64,
        snapshot: &[Card],
        result: Result<SaveAck, RemoteError>,
    ) -> SaveOutcome {
        match result {
            Ok(ack) if self.settings.is_success_status(&ack.status) => {
                let applied = self.session().mark_saved(key, revision, snapshot);
                log::info!("[flashdeck.sync] Saved sheet {} ({} cards)", key, snapshot.len());
                self.emit(SyncEvent::Saved {
                    key: key.clone(),
                    cards: snapshot.len(),
                });
                SaveOutcome::Saved {
                    key: key.clone(),
                    cards: snapshot.len(),
                    applied,
                }
            }
            Ok(ack) => {
                log::warn!(
                    "[flashdeck.sync] Unrecognized save status for {}: {:?}",
                    key,
                    ack.status
                );
                self.emit(SyncEvent::SaveFailed {
                    key: key.clone(),
                    message: format!("unrecognized status {:?}", ack.status),
                });
                SaveOutcome::Uncertain {
                    key: key.clone(),
                    status: ack.status,
                }
            }
            Err(e) => {
                log::warn!("[flashdeck.sync] Save of sheet {} failed: {}", key, e);
                self.emit(SyncEvent::SaveFailed {
                    key: key.clone(),
                    message: e.to_string(),
                });
                SaveOutcome::Failed {
                    key: key.clone(),
                    error: e.into(),
                }
            }
        }
    }

    /// Drop unsaved edits on the active sheet, unless a save of it is running.
    pub fn discard(&self) -> DiscardOutcome {
        let mut session = self.session();
        let Some(key) = session.active_key().cloned() else {
            return DiscardOutcome::NothingToDiscard;
        };
        if self.save_in_flight(&key) {
            log::info!("[flashdeck.sync] Discard on {} refused, save in flight", key);
            return DiscardOutcome::SaveInFlight { key };
        }
        if session.discard_changes() {
            DiscardOutcome::Discarded { key }
        } else {
            DiscardOutcome::NothingToDiscard
        }
    }

    /// Download `key` again, replacing its cached copy.
    pub async fn refetch(&self, key: &SheetKey) -> RefetchOutcome {
        let blocked = |session: &Session| session.is_active(key) && session.is_dirty();
        if blocked(&*self.session()) {
            return RefetchOutcome::Blocked { key: key.clone() };
        }

        let cards = match self.fetch_cards(key).await {
            Ok(cards) => cards,
            Err(error) => {
                return RefetchOutcome::Failed {
                    key: key.clone(),
                    error,
                }
            }
        };

        let mut session = self.session();
        self.set_load_state(key, SheetLoadState::Loaded);
        if blocked(&*session) {
            return RefetchOutcome::Blocked { key: key.clone() };
        }
        let changed = session
            .cache()
            .entry(key)
            .map_or(true, |e| e.synced_hash != SheetCache::fingerprint(&cards));
        session.cache_mut().put(key, &cards);
        if session.is_active(key) {
            session.activate(key);
        }
        RefetchOutcome::Refreshed {
            key: key.clone(),
            cards: cards.len(),
            changed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Confirmation;
    use serde_json::{json, Value};
    use std::collections::HashSet;
    use tokio::sync::{Notify, Semaphore};

    struct Gate {
        entered: Notify,
        release: Semaphore,
    }

    impl Gate {
        fn new() -> Self {
            Self {
                entered: Notify::new(),
                release: Semaphore::new(0),
            }
        }

        async fn pass(&self) {
            self.entered.notify_one();
            if let Ok(permit) = self.release.acquire().await {
                permit.forget();
            }
        }
    }

    struct FakeRemote {
        sheets: Mutex<HashMap<String, Value>>,
        failing: Mutex<HashSet<String>>,
        save_reply: Mutex<Result<String, String>>,
        saved: Mutex<Vec<(String, Vec<SheetRow>)>>,
        fetches: AtomicUsize,
        fetch_gate: Option<(String, Gate)>,
        save_gate: Option<Gate>,
    }

    impl FakeRemote {
        fn new() -> Self {
            let mut sheets = HashMap::new();
            sheets.insert("eng1".to_string(), json!([["hello", "こんにちは", 2], ["x", "y"]]));
            sheets.insert("eng2".to_string(), json!({ "data": [["a", "b", 1], ["c", "d", 5], ["e", "f", 3]] }));
            sheets.insert("eng3".to_string(), json!([["one", "1", 4]]));
            Self {
                sheets: Mutex::new(sheets),
                failing: Mutex::new(HashSet::new()),
                save_reply: Mutex::new(Ok("success".to_string())),
                saved: Mutex::new(Vec::new()),
                fetches: AtomicUsize::new(0),
                fetch_gate: None,
                save_gate: None,
            }
        }

        fn fail(&self, sheet: &str) {
            lock(&self.failing).insert(sheet.to_string());
        }

        fn reply(&self, reply: Result<&str, &str>) {
            *lock(&self.save_reply) = reply.map(String::from).map_err(String::from);
        }

        fn save_count(&self) -> usize {
            lock(&self.saved).len()
        }
    }

    impl SheetRemote for FakeRemote {
        async fn fetch_sheet(&self, sheet: &str) -> Result<Vec<Value>, RemoteError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if let Some((gated, gate)) = &self.fetch_gate {
                if gated == sheet {
                    gate.pass().await;
                }
            }
            if lock(&self.failing).contains(sheet) {
                return Err(RemoteError::HttpStatus { status: 500 });
            }
            let body = lock(&self.sheets).get(sheet).cloned().unwrap_or(json!([]));
            crate::remote::parse_fetch_body(body)
        }

        async fn save_sheet(&self, sheet: &str, rows: &[SheetRow]) -> Result<SaveAck, RemoteError> {
            if let Some(gate) = &self.save_gate {
                gate.pass().await;
            }
            lock(&self.saved).push((sheet.to_string(), rows.to_vec()));
            let reply = lock(&self.save_reply).clone();
            match reply {
                Ok(status) => Ok(SaveAck { status }),
                Err(message) => Err(RemoteError::Transport(message)),
            }
        }
    }

    fn key(k: &str) -> SheetKey {
        SheetKey::from(k)
    }

    fn controller(remote: FakeRemote, policy: SwitchPolicy) -> SyncController<FakeRemote> {
        let settings = SyncSettings {
            switch_policy: policy,
            ..SyncSettings::default()
        };
        SyncController::new(remote, SheetCatalog::default(), settings)
    }

    #[tokio::test]
    async fn test_load_normalizes_fetched_rows() {
        let sync = controller(FakeRemote::new(), SwitchPolicy::Autosave);
        let outcome = sync.load_set(&key("0")).await;
        assert!(matches!(outcome, LoadOutcome::Activated { cards: 2, from_cache: false, .. }));
        assert_eq!(
            sync.session().cards(),
            &[Card::new(1, "hello", "こんにちは", 2), Card::new(2, "x", "y", 3)]
        );
        assert_eq!(sync.load_state(&key("0")), SheetLoadState::Loaded);
        assert!(!sync.is_busy());
    }

    #[tokio::test]
    async fn test_preload_isolates_failures() {
        let remote = FakeRemote::new();
        remote.fail("eng3");
        remote.fail("old1");
        let sync = controller(remote, SwitchPolicy::Autosave);

        let report = sync.preload_all().await;
        assert_eq!(report.loaded.len(), 3);
        assert_eq!(report.failed.len(), 2);

        let session = sync.session();
        for k in ["0", "1", "2", "3", "4"] {
            assert!(session.cache().has(&key(k)));
        }
        assert!(session.cache().get(&key("2")).unwrap().is_empty());
        assert_eq!(session.cache().get(&key("1")).unwrap().len(), 3);
        drop(session);
        assert_eq!(sync.load_state(&key("3")), SheetLoadState::Loaded);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_network() {
        let sync = controller(FakeRemote::new(), SwitchPolicy::Autosave);
        sync.preload_all().await;
        let fetched = sync.remote().fetches.load(Ordering::SeqCst);

        let outcome = sync.load_set(&key("1")).await;
        assert!(matches!(outcome, LoadOutcome::Activated { from_cache: true, .. }));
        assert_eq!(sync.remote().fetches.load(Ordering::SeqCst), fetched);

        let report = sync.preload_all().await;
        assert_eq!(report.skipped.len(), 5);
        assert_eq!(sync.remote().fetches.load(Ordering::SeqCst), fetched);
    }

    #[tokio::test]
    async fn test_failed_load_keeps_previous_sheet() {
        let remote = FakeRemote::new();
        remote.fail("eng2");
        let sync = controller(remote, SwitchPolicy::Autosave);
        sync.load_set(&key("0")).await;

        let outcome = sync.load_set(&key("1")).await;
        assert!(matches!(outcome, LoadOutcome::Failed { .. }));
        assert_eq!(outcome.notice().level, crate::types::NoticeLevel::Error);
        assert_eq!(sync.session().active_key(), Some(&key("0")));
        assert!(!sync.session().cache().has(&key("1")));
        assert_eq!(sync.load_state(&key("1")), SheetLoadState::Unloaded);
    }

    #[tokio::test]
    async fn test_unknown_sheet() {
        let sync = controller(FakeRemote::new(), SwitchPolicy::Autosave);
        let outcome = sync.load_set(&key("42")).await;
        assert!(matches!(
            outcome,
            LoadOutcome::Failed { error: SyncError::UnknownSheet(_), .. }
        ));
    }

    #[tokio::test]
    async fn test_save_when_clean_makes_no_request() {
        let sync = controller(FakeRemote::new(), SwitchPolicy::Autosave);
        sync.load_set(&key("0")).await;
        let outcome = sync.save_all().await;
        assert!(matches!(outcome, SaveOutcome::NothingToSave));
        assert_eq!(sync.remote().save_count(), 0);
    }

    #[tokio::test]
    async fn test_dirty_lifecycle() {
        let sync = controller(FakeRemote::new(), SwitchPolicy::Autosave);
        sync.load_set(&key("0")).await;
        assert!(!sync.session().is_dirty());

        sync.session().set_level(1, 5).unwrap();
        assert!(sync.session().is_dirty());

        sync.remote().reply(Ok("maybe"));
        assert!(matches!(sync.save_all().await, SaveOutcome::Uncertain { .. }));
        assert!(sync.session().is_dirty());

        sync.remote().reply(Err("connection reset"));
        assert!(matches!(sync.save_all().await, SaveOutcome::Failed { .. }));
        assert!(sync.session().is_dirty());

        sync.remote().reply(Ok("OK"));
        let outcome = sync.save_all().await;
        assert!(matches!(outcome, SaveOutcome::Saved { applied: SaveApplied::Clean, cards: 2, .. }));
        assert!(!sync.session().is_dirty());
        assert!(!sync.save_in_flight(&key("0")));

        let saved = lock(&sync.remote().saved);
        let (sheet, rows) = saved.last().unwrap();
        assert_eq!(sheet, "eng1");
        assert_eq!(rows[1], SheetRow("x".into(), "y".into(), 5));
    }

    #[tokio::test]
    async fn test_autosave_switch_blocked_on_failure() {
        let sync = controller(FakeRemote::new(), SwitchPolicy::Autosave);
        sync.preload_all().await;
        sync.load_set(&key("0")).await;
        sync.session().add_card("new", "card", 1).unwrap();

        sync.remote().reply(Err("offline"));
        let outcome = sync.load_set(&key("1")).await;
        assert!(matches!(outcome, LoadOutcome::Blocked { .. }));
        assert_eq!(sync.session().active_key(), Some(&key("0")));
        assert!(sync.session().is_dirty());

        sync.remote().reply(Ok("done"));
        let outcome = sync.load_set(&key("1")).await;
        assert!(matches!(outcome, LoadOutcome::Activated { .. }));
        assert_eq!(sync.remote().save_count(), 2);
        assert_eq!(sync.session().cache().get(&key("0")).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_discard_switch_rolls_back() {
        let sync = controller(FakeRemote::new(), SwitchPolicy::Discard);
        sync.preload_all().await;
        sync.load_set(&key("0")).await;
        sync.session().delete_current(Confirmation::Accepted).unwrap();
        assert_eq!(sync.session().cache().get(&key("0")).unwrap().len(), 1);

        sync.load_set(&key("1")).await;
        assert_eq!(sync.remote().save_count(), 0);
        assert!(!sync.session().is_dirty());

        sync.load_set(&key("0")).await;
        assert_eq!(sync.session().cards().len(), 2);
    }

    #[tokio::test]
    async fn test_same_sheet_reload_keeps_edits() {
        let sync = controller(FakeRemote::new(), SwitchPolicy::Discard);
        sync.load_set(&key("1")).await;
        sync.session().jump_to_visible_rank(2);
        sync.session().set_current_level(2).unwrap();

        sync.load_set(&key("1")).await;
        assert!(sync.session().is_dirty());
        assert_eq!(sync.session().current_position(), Some(0));
        assert_eq!(sync.session().cards()[2].level, 2);
    }

    #[tokio::test]
    async fn test_stale_load_not_activated() {
        let mut remote = FakeRemote::new();
        remote.fetch_gate = Some(("eng2".to_string(), Gate::new()));
        let sync = controller(remote, SwitchPolicy::Autosave);
        sync.load_set(&key("0")).await;

        let gate = &sync.remote().fetch_gate.as_ref().unwrap().1;
        let (slow_key, fast_key) = (key("1"), key("2"));
        let (slow, _) = tokio::join!(sync.load_set(&slow_key), async {
            gate.entered.notified().await;
            let fast = sync.load_set(&fast_key).await;
            assert!(matches!(fast, LoadOutcome::Activated { from_cache: false, .. }));
            gate.release.add_permits(1);
        });

        assert!(matches!(slow, LoadOutcome::Superseded { .. }));
        assert_eq!(sync.session().active_key(), Some(&key("2")));
        assert!(sync.session().cache().has(&key("1")));
    }

    #[tokio::test]
    async fn test_second_save_is_queued() {
        let mut remote = FakeRemote::new();
        remote.save_gate = Some(Gate::new());
        let sync = controller(remote, SwitchPolicy::Autosave);
        sync.load_set(&key("0")).await;
        sync.session().set_level(0, 1).unwrap();

        let gate = sync.remote().save_gate.as_ref().unwrap();
        let (first, _) = tokio::join!(sync.save_all(), async {
            gate.entered.notified().await;
            sync.session().set_level(1, 4).unwrap();
            let second = sync.save_all().await;
            assert!(matches!(second, SaveOutcome::Queued { .. }));
            gate.release.add_permits(2);
        });

        assert!(matches!(first, SaveOutcome::Saved { applied: SaveApplied::Clean, .. }));
        assert_eq!(sync.remote().save_count(), 2);
        assert!(!sync.session().is_dirty());
        let saved = lock(&sync.remote().saved);
        assert_eq!(saved[0].1[1].2, 3);
        assert_eq!(saved[1].1[1].2, 4);
    }

    #[tokio::test]
    async fn test_save_completing_after_switch() {
        let mut remote = FakeRemote::new();
        remote.save_gate = Some(Gate::new());
        let sync = controller(remote, SwitchPolicy::Discard);
        sync.preload_all().await;
        sync.load_set(&key("0")).await;
        sync.session().set_level(0, 5).unwrap();

        let gate = sync.remote().save_gate.as_ref().unwrap();
        let (outcome, _) = tokio::join!(sync.save_all(), async {
            gate.entered.notified().await;
            sync.load_set(&key("1")).await;
            gate.release.add_permits(1);
        });

        assert!(matches!(outcome, SaveOutcome::Saved { applied: SaveApplied::Inactive, .. }));
        assert_eq!(outcome.notice().message, "Saved 2 cards to sheet 0");
        let session = sync.session();
        assert_eq!(session.active_key(), Some(&key("1")));
        assert!(!session.is_dirty());
        assert_eq!(session.cards().len(), 3);
        // The server holds the saved rows, so the cache follows them.
        assert_eq!(session.cache().get(&key("0")).unwrap()[0].level, 5);
        assert!(!session.cache().entry(&key("0")).unwrap().has_unsynced_changes());
    }

    #[tokio::test]
    async fn test_refetch_detects_changes() {
        let sync = controller(FakeRemote::new(), SwitchPolicy::Autosave);
        sync.load_set(&key("0")).await;

        let outcome = sync.refetch(&key("0")).await;
        assert!(matches!(outcome, RefetchOutcome::Refreshed { changed: false, .. }));

        lock(&sync.remote().sheets).insert("eng1".to_string(), json!([["new", "row", 1]]));
        let outcome = sync.refetch(&key("0")).await;
        assert!(matches!(outcome, RefetchOutcome::Refreshed { changed: true, cards: 1, .. }));
        assert_eq!(sync.session().cards()[0].front, "new");

        sync.session().set_level(0, 2).unwrap();
        assert!(matches!(sync.refetch(&key("0")).await, RefetchOutcome::Blocked { .. }));
    }

    #[tokio::test]
    async fn test_events_broadcast() {
        let sync = controller(FakeRemote::new(), SwitchPolicy::Autosave);
        let mut rx = sync.subscribe();
        sync.load_set(&key("0")).await;
        assert_eq!(rx.recv().await.unwrap(), SyncEvent::FetchStarted { key: key("0") });
        assert_eq!(
            rx.recv().await.unwrap(),
            SyncEvent::SheetFetched { key: key("0"), cards: 2 }
        );
        assert_eq!(rx.recv().await.unwrap(), SyncEvent::SheetActivated { key: key("0") });
    }

    #[tokio::test]
    async fn test_edits_during_switch_fetch_block_the_switch() {
        let mut remote = FakeRemote::new();
        remote.fetch_gate = Some(("eng2".to_string(), Gate::new()));
        let sync = controller(remote, SwitchPolicy::Autosave);
        sync.load_set(&key("0")).await;
        sync.session().set_level(0, 4).unwrap();

        let gate = &sync.remote().fetch_gate.as_ref().unwrap().1;
        let target = key("1");
        let (outcome, _) = tokio::join!(sync.load_set(&target), async {
            gate.entered.notified().await;
            sync.session().set_level(1, 1).unwrap();
            gate.release.add_permits(1);
        });

        assert!(matches!(outcome, LoadOutcome::Blocked { .. }));
        assert_eq!(sync.remote().save_count(), 1);
        {
            let session = sync.session();
            assert_eq!(session.active_key(), Some(&key("0")));
            assert!(session.is_dirty());
            assert_eq!(session.cards()[1].level, 1);
            assert!(session.cache().has(&key("1")));
        }

        let saved = sync.save_all().await;
        assert!(matches!(saved, SaveOutcome::Saved { applied: SaveApplied::Clean, .. }));
        assert_eq!(lock(&sync.remote().saved)[1].1[1].2, 1);
        let fetched = sync.remote().fetches.load(Ordering::SeqCst);
        let outcome = sync.load_set(&target).await;
        assert!(matches!(outcome, LoadOutcome::Activated { from_cache: true, .. }));
        assert_eq!(sync.remote().fetches.load(Ordering::SeqCst), fetched);
    }

    #[tokio::test]
    async fn test_discard_refused_while_saving() {
        let mut remote = FakeRemote::new();
        remote.save_gate = Some(Gate::new());
        let sync = controller(remote, SwitchPolicy::Autosave);
        sync.load_set(&key("0")).await;
        sync.session().set_level(0, 5).unwrap();

        let gate = sync.remote().save_gate.as_ref().unwrap();
        let (outcome, _) = tokio::join!(sync.save_all(), async {
            gate.entered.notified().await;
            assert_eq!(sync.discard(), DiscardOutcome::SaveInFlight { key: key("0") });
            gate.release.add_permits(1);
        });

        assert!(matches!(outcome, SaveOutcome::Saved { applied: SaveApplied::Clean, .. }));
        let session = sync.session();
        assert!(!session.is_dirty());
        assert_eq!(session.cards()[0].level, 5);
        assert!(!session.cache().entry(&key("0")).unwrap().has_unsynced_changes());
    }

    #[tokio::test]
    async fn test_discard_after_save_restores_synced() {
        let sync = controller(FakeRemote::new(), SwitchPolicy::Autosave);
        assert_eq!(sync.discard(), DiscardOutcome::NothingToDiscard);
        sync.load_set(&key("0")).await;
        sync.session().set_level(0, 5).unwrap();
        sync.save_all().await;
        sync.session().set_level(0, 1).unwrap();

        assert_eq!(sync.discard(), DiscardOutcome::Discarded { key: key("0") });
        assert!(!sync.session().is_dirty());
        assert_eq!(sync.session().cards()[0].level, 5);
        assert_eq!(sync.discard(), DiscardOutcome::NothingToDiscard);
    }

    #[tokio::test]
    async fn test_queued_save_runs_after_failed_attempt() {
        let mut remote = FakeRemote::new();
        remote.save_gate = Some(Gate::new());
        let sync = controller(remote, SwitchPolicy::Autosave);
        sync.load_set(&key("0")).await;
        sync.session().set_level(0, 1).unwrap();
        sync.remote().reply(Err("timeout"));

        let gate = sync.remote().save_gate.as_ref().unwrap();
        let (outcome, _) = tokio::join!(sync.save_all(), async {
            gate.entered.notified().await;
            sync.session().set_level(1, 4).unwrap();
            assert!(matches!(sync.save_all().await, SaveOutcome::Queued { .. }));
            gate.release.add_permits(1);

            gate.entered.notified().await;
            sync.remote().reply(Ok("success"));
            gate.release.add_permits(1);
        });

        assert!(matches!(outcome, SaveOutcome::Saved { applied: SaveApplied::Clean, .. }));
        assert_eq!(sync.remote().save_count(), 2);
        assert!(!sync.session().is_dirty());
        assert!(!sync.save_in_flight(&key("0")));
        let saved = lock(&sync.remote().saved);
        assert_eq!(saved[1].1[0].2, 1);
        assert_eq!(saved[1].1[1].2, 4);
    }
}
