/// Line-oriented study shell on top of the sync controller.
///
/// The shell is the view layer: it parses commands, asks for confirmation
/// before destructive edits, and renders the deck view as text. All state
/// lives in the controller's session; the shell only keeps the pending
/// confirmation and the quit guard.
use flashdeck_core::filter::LevelFilter;
use flashdeck_core::remote::SheetRemote;
use flashdeck_core::session::{CardView, DeckView};
use flashdeck_core::sync::SyncController;
use flashdeck_core::types::{Confirmation, Notice, SheetKey, ALL_LEVELS, DEFAULT_LEVEL};
use std::time::Duration;

use crate::log_bridge;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("Unknown command: {0} (try `help`)")]
    UnknownCommand(String),

    #[error("Missing argument: {0}")]
    MissingArgument(&'static str),

    #[error("Not a number: {0}")]
    InvalidNumber(String),

    #[error("Expected `front | back | level`")]
    BadCardText,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Show,
    Next,
    Prev,
    /// 1-based rank among visible cards
    Jump(usize),
    Flip,
    Sheets,
    Sheet(String),
    Levels(Option<Vec<i64>>),
    Toggle(i64),
    Add { front: String, back: String, level: i64 },
    Edit { front: String, back: String, level: Option<i64> },
    Level(i64),
    Delete,
    Batch,
    /// 1-based visible ranks
    Select(Vec<usize>),
    SelectAll,
    ClearSelection,
    BatchDelete,
    BatchLevel(i64),
    Done,
    Save,
    Discard,
    Refetch(Option<String>),
    Log(usize),
    Quit,
}

fn number<T: std::str::FromStr>(s: &str) -> Result<T, ParseError> {
    s.parse().map_err(|_| ParseError::InvalidNumber(s.to_string()))
}

fn card_parts(rest: &str) -> Vec<String> {
    rest.split('|').map(|p| p.trim().to_string()).collect()
}

pub fn parse_command(line: &str) -> Result<Command, ParseError> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((w, r)) => (w, r.trim()),
        None => (line, ""),
    };
    let args: Vec<&str> = rest.split_whitespace().collect();

    let cmd = match word.to_lowercase().as_str() {
        "" | "show" | "s" => Command::Show,
        "help" | "h" | "?" => Command::Help,
        "next" | "n" => Command::Next,
        "prev" | "p" => Command::Prev,
        "jump" | "j" => Command::Jump(number(args.first().ok_or(ParseError::MissingArgument("rank"))?)?),
        "flip" | "f" => Command::Flip,
        "sheets" => Command::Sheets,
        "sheet" => Command::Sheet(
            args.first()
                .ok_or(ParseError::MissingArgument("sheet key"))?
                .to_string(),
        ),
        "levels" => {
            if args.is_empty() {
                Command::Levels(None)
            } else {
                let levels = args.iter().map(|a| number(a)).collect::<Result<Vec<i64>, _>>()?;
                Command::Levels(Some(levels))
            }
        }
        "toggle" => Command::Toggle(number(args.first().ok_or(ParseError::MissingArgument("level"))?)?),
        "add" => {
            let parts = card_parts(rest);
            match parts.as_slice() {
                [front, back] => Command::Add {
                    front: front.clone(),
                    back: back.clone(),
                    level: DEFAULT_LEVEL,
                },
                [front, back, level] => Command::Add {
                    front: front.clone(),
                    back: back.clone(),
                    level: number(level)?,
                },
                _ => return Err(ParseError::BadCardText),
            }
        }
        "edit" => {
            let parts = card_parts(rest);
            match parts.as_slice() {
                [front, back] => Command::Edit {
                    front: front.clone(),
                    back: back.clone(),
                    level: None,
                },
                [front, back, level] => Command::Edit {
                    front: front.clone(),
                    back: back.clone(),
                    level: Some(number(level)?),
                },
                _ => return Err(ParseError::BadCardText),
            }
        }
        "level" => Command::Level(number(args.first().ok_or(ParseError::MissingArgument("level"))?)?),
        "delete" | "del" => Command::Delete,
        "batch" => Command::Batch,
        "select" => match args.as_slice() {
            [] => return Err(ParseError::MissingArgument("rank or `all`")),
            ["all"] => Command::SelectAll,
            ranks => Command::Select(ranks.iter().map(|r| number(r)).collect::<Result<_, _>>()?),
        },
        "clear" => Command::ClearSelection,
        "batch-delete" => Command::BatchDelete,
        "batch-level" => {
            Command::BatchLevel(number(args.first().ok_or(ParseError::MissingArgument("level"))?)?)
        }
        "done" => Command::Done,
        "save" | "w" => Command::Save,
        "discard" => Command::Discard,
        "refetch" => Command::Refetch(args.first().map(|s| s.to_string())),
        "log" => Command::Log(match args.first() {
            Some(n) => number(n)?,
            None => 20,
        }),
        "quit" | "q" | "exit" => Command::Quit,
        other => return Err(ParseError::UnknownCommand(other.to_string())),
    };
    Ok(cmd)
}

pub const HELP: &str = "\
show | next (n) | prev (p) | jump <n> | flip (f)
sheets | sheet <key> | refetch [key]
levels [1-5 ...] | toggle <level>
add <front> | <back> [| level]
edit <front> | <back> [| level] | level <n> | delete
batch | select <n>... | select all | clear | batch-level <n> | batch-delete | done
save | discard | log [n] | quit";

fn level_badge(level: i64) -> String {
    if (1..=5).contains(&level) {
        let filled = level as usize;
        format!("{}{}", "*".repeat(filled), ".".repeat(5 - filled))
    } else {
        format!("L{}", level)
    }
}

fn slider(view: &CardView) -> String {
    const WIDTH: usize = 20;
    let pos = if view.slider_max() == 0 {
        0
    } else {
        (view.rank - 1) * (WIDTH - 1) / view.slider_max()
    };
    let mut bar: Vec<char> = vec!['-'; WIDTH];
    bar[pos] = '|';
    bar.into_iter().collect()
}

pub fn render_filter(filter: &LevelFilter) -> String {
    ALL_LEVELS
        .iter()
        .map(|&l| {
            if filter.accepts(l) {
                format!("[{}]", l)
            } else {
                format!(" {} ", l)
            }
        })
        .collect::<Vec<_>>()
        .join("")
}

pub fn render_view(view: &DeckView) -> Vec<String> {
    match view {
        DeckView::NoSheet => vec!["No sheet open. Use `sheet <key>`.".to_string()],
        DeckView::Empty { key } => vec![format!("Sheet {} has no cards. Use `add`.", key)],
        DeckView::NoneVisible { key, total } => vec![format!(
            "Sheet {}: none of {} cards match the level filter.",
            key, total
        )],
        DeckView::Card(view) => {
            let mut header = format!(
                "[{}] {}  {}  {}",
                view.key,
                view.counter(),
                level_badge(view.card.level),
                slider(view)
            );
            if view.dirty {
                header.push_str("  (unsaved)");
            }
            if view.batch_mode {
                header.push_str(if view.selected { "  [selected]" } else { "  [ ]" });
            }
            let side = if view.flipped { "back " } else { "front" };
            vec![header, format!("  {}: {}", side, view.face())]
        }
    }
}

fn notice_line(notice: &Notice) -> String {
    notice.to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingAction {
    DeleteCurrent,
    DeleteSelected,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ShellReply {
    pub lines: Vec<String>,
    pub quit: bool,
}

impl ShellReply {
    fn lines(lines: Vec<String>) -> Self {
        Self { lines, quit: false }
    }

    fn line(line: impl Into<String>) -> Self {
        Self::lines(vec![line.into()])
    }
}

pub struct Shell<'a, R: SheetRemote> {
    controller: &'a SyncController<R>,
    flip_delay: Duration,
    pending: Option<PendingAction>,
    quit_armed: bool,
}

impl<'a, R: SheetRemote> Shell<'a, R> {
    pub fn new(controller: &'a SyncController<R>, flip_delay: Duration) -> Self {
        Self {
            controller,
            flip_delay,
            pending: None,
            quit_armed: false,
        }
    }

    pub fn prompt(&self) -> String {
        if self.pending.is_some() {
            return "confirm [y/N]> ".to_string();
        }
        let session = self.controller.session();
        let key = session
            .active_key()
            .map(|k| k.to_string())
            .unwrap_or_else(|| "-".to_string());
        let dirty = if session.is_dirty() { "*" } else { "" };
        let batch = if session.batch_mode() { " batch" } else { "" };
        format!("flashdeck[{}{}{}]> ", key, dirty, batch)
    }

    fn view_lines(&self) -> Vec<String> {
        render_view(&self.controller.session().view())
    }

    fn with_view(&self, mut lines: Vec<String>) -> ShellReply {
        lines.extend(self.view_lines());
        ShellReply::lines(lines)
    }

    /// Turn a flipped card back to its front before moving, as the card UI does.
    async fn unflip(&self) {
        let flipped = {
            let mut session = self.controller.session();
            match session.view() {
                DeckView::Card(view) if view.flipped => {
                    session.flip();
                    true
                }
                _ => false,
            }
        };
        if flipped && !self.flip_delay.is_zero() {
            tokio::time::sleep(self.flip_delay).await;
        }
    }

    fn visible_positions(&self, ranks: &[usize]) -> Result<Vec<usize>, String> {
        let visible = self.controller.session().visible();
        ranks
            .iter()
            .map(|&r| {
                r.checked_sub(1)
                    .and_then(|i| visible.get(i).copied())
                    .ok_or_else(|| format!("No visible card #{} (1-{})", r, visible.len()))
            })
            .collect()
    }

    pub async fn handle_line(&mut self, line: &str) -> ShellReply {
        if let Some(action) = self.pending.take() {
            return self.confirm(action, Confirmation::from_answer(line));
        }
        match parse_command(line) {
            Ok(cmd) => self.execute(cmd).await,
            Err(e) => ShellReply::line(e.to_string()),
        }
    }

    fn confirm(&mut self, action: PendingAction, answer: Confirmation) -> ShellReply {
        let result = {
            let mut session = self.controller.session();
            match action {
                PendingAction::DeleteCurrent => session.delete_current(answer),
                PendingAction::DeleteSelected => session.delete_selected(answer),
            }
        };
        match result {
            Ok(outcome) => self.with_view(vec![notice_line(&outcome.notice())]),
            Err(e) => ShellReply::line(e.to_string()),
        }
    }

    async fn execute(&mut self, cmd: Command) -> ShellReply {
        if cmd != Command::Quit {
            self.quit_armed = false;
        }
        let controller = self.controller;

        match cmd {
            Command::Help => ShellReply::line(HELP),
            Command::Show => ShellReply::lines(self.view_lines()),
            Command::Next => {
                self.unflip().await;
                controller.session().next();
                ShellReply::lines(self.view_lines())
            }
            Command::Prev => {
                self.unflip().await;
                controller.session().prev();
                ShellReply::lines(self.view_lines())
            }
            Command::Jump(rank) => {
                self.unflip().await;
                controller.session().jump_to_visible_rank(rank.saturating_sub(1));
                ShellReply::lines(self.view_lines())
            }
            Command::Flip => {
                controller.session().flip();
                ShellReply::lines(self.view_lines())
            }
            Command::Sheets => ShellReply::lines(self.sheet_lines()),
            Command::Sheet(key) => {
                let outcome = controller.load_set(&SheetKey::new(key)).await;
                self.with_view(vec![notice_line(&outcome.notice())])
            }
            Command::Levels(None) => {
                ShellReply::line(render_filter(controller.session().filter()))
            }
            Command::Levels(Some(levels)) => {
                controller.session().set_levels(levels);
                let filter = render_filter(controller.session().filter());
                self.with_view(vec![filter])
            }
            Command::Toggle(level) => {
                controller.session().toggle_level(level);
                let filter = render_filter(controller.session().filter());
                self.with_view(vec![filter])
            }
            Command::Add { front, back, level } => {
                let result = controller.session().add_card(&front, &back, level);
                self.edit_reply(result)
            }
            Command::Edit { front, back, level } => {
                let result = {
                    let mut session = controller.session();
                    let level = level
                        .or_else(|| session.current_card().map(|c| c.level))
                        .unwrap_or(DEFAULT_LEVEL);
                    session.edit_current(&front, &back, level)
                };
                self.edit_reply(result)
            }
            Command::Level(level) => {
                let result = controller.session().set_current_level(level);
                self.edit_reply(result)
            }
            Command::Delete => {
                let card = controller.session().current_card().cloned();
                match card {
                    Some(card) => {
                        self.pending = Some(PendingAction::DeleteCurrent);
                        ShellReply::line(format!("Delete card #{} \"{}\"?", card.id, card.front))
                    }
                    None => ShellReply::line("No card is shown"),
                }
            }
            Command::Batch => {
                controller.session().enter_batch_mode();
                self.with_view(vec!["Batch mode: `select <n>...`, then `batch-level` or `batch-delete`".to_string()])
            }
            Command::Select(ranks) => {
                let positions = match self.visible_positions(&ranks) {
                    Ok(p) => p,
                    Err(msg) => return ShellReply::line(msg),
                };
                let mut session = controller.session();
                for p in positions {
                    if let Err(e) = session.toggle_selection(p) {
                        return ShellReply::line(e.to_string());
                    }
                }
                ShellReply::line(format!("{} selected", session.selection().len()))
            }
            Command::SelectAll => {
                let mut session = controller.session();
                session.select_visible();
                ShellReply::line(format!("{} selected", session.selection().len()))
            }
            Command::ClearSelection => {
                controller.session().clear_selection();
                ShellReply::line("Selection cleared")
            }
            Command::BatchDelete => {
                let count = controller.session().selection().len();
                if count == 0 {
                    return ShellReply::line(notice_line(&Notice::info("Nothing selected")));
                }
                self.pending = Some(PendingAction::DeleteSelected);
                ShellReply::line(format!("Delete {} selected cards?", count))
            }
            Command::BatchLevel(level) => {
                let result = controller.session().set_selected_level(level);
                self.edit_reply(result)
            }
            Command::Done => {
                controller.session().exit_batch_mode();
                ShellReply::lines(self.view_lines())
            }
            Command::Save => {
                let outcome = controller.save_all().await;
                ShellReply::line(notice_line(&outcome.notice()))
            }
            Command::Discard => {
                let outcome = controller.discard();
                self.with_view(vec![notice_line(&outcome.notice())])
            }
            Command::Refetch(key) => {
                let key = match key.map(SheetKey::new).or_else(|| controller.session().active_key().cloned()) {
                    Some(k) => k,
                    None => return ShellReply::line("No sheet open"),
                };
                let outcome = controller.refetch(&key).await;
                self.with_view(vec![notice_line(&outcome.notice())])
            }
            Command::Log(limit) => {
                let mut lines: Vec<String> = log_bridge::recent_entries(limit)
                    .iter()
                    .map(log_bridge::format_log_line)
                    .collect();
                lines.push(format!("(full log: {})", log_bridge::log_file_path()));
                ShellReply::lines(lines)
            }
            Command::Quit => {
                if controller.session().is_dirty() && !self.quit_armed {
                    self.quit_armed = true;
                    return ShellReply::line("Unsaved changes. `save` first, or `quit` again to leave anyway.");
                }
                ShellReply {
                    lines: Vec::new(),
                    quit: true,
                }
            }
        }
    }

    fn edit_reply(
        &self,
        result: Result<flashdeck_core::edit::EditOutcome, flashdeck_core::edit::EditError>,
    ) -> ShellReply {
        match result {
            Ok(outcome) => self.with_view(vec![notice_line(&outcome.notice())]),
            Err(e) => ShellReply::line(e.to_string()),
        }
    }

    fn sheet_lines(&self) -> Vec<String> {
        let session = self.controller.session();
        let cache = session.cache();
        let summaries = cache.summaries();
        let mut lines: Vec<String> = self
            .controller
            .catalog()
            .entries()
            .iter()
            .map(|entry| {
                let active = if session.is_active(&entry.key) { ">" } else { " " };
                let detail = match summaries.iter().find(|s| s.key == entry.key) {
                    Some(summary) => {
                        let unsaved = summary.unsynced
                            || (session.is_active(&entry.key) && session.is_dirty());
                        format!(
                            "{} cards, synced {}{}",
                            summary.card_count,
                            summary.synced_at.format("%H:%M:%S"),
                            if unsaved { ", unsaved edits" } else { "" }
                        )
                    }
                    None => format!("{:?}", self.controller.load_state(&entry.key)).to_lowercase(),
                };
                format!("{} {}  {}  ({})", active, entry.key, entry.label(), detail)
            })
            .collect();
        if cache.is_empty() {
            lines.push("No sheet downloaded yet.".to_string());
        } else {
            lines.push(format!(
                "{} of {} sheets cached",
                cache.len(),
                self.controller.catalog().entries().len()
            ));
        }
        lines
    }
}
