use serde::{Deserialize, Serialize};
use std::fmt;

/// Level assigned when a row carries no usable level.
pub const DEFAULT_LEVEL: i64 = 3;
pub const MIN_LEVEL: i64 = 1;
pub const MAX_LEVEL: i64 = 5;

/// All levels a user can filter on or assign.
pub const ALL_LEVELS: [i64; 5] = [1, 2, 3, 4, 5];

pub fn is_valid_level(level: i64) -> bool {
    (MIN_LEVEL..=MAX_LEVEL).contains(&level)
}

/// One study item.
///
/// `id` is positional: it always equals `position + 1` after a structural
/// mutation and must not be used as a key across mutations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    pub id: usize,
    pub front: String,
    pub back: String,
    pub level: i64,
}

impl Card {
    pub fn new(id: usize, front: impl Into<String>, back: impl Into<String>, level: i64) -> Self {
        Self {
            id,
            front: front.into(),
            back: back.into(),
            level,
        }
    }

    /// Wire form sent to the remote store: `[front, back, level]`.
    pub fn to_row(&self) -> SheetRow {
        SheetRow(self.front.clone(), self.back.clone(), self.level)
    }
}

/// Serialized card as written back to the spreadsheet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetRow(pub String, pub String, pub i64);

/// Reassign `id = position + 1` for every card.
pub fn renumber(cards: &mut [Card]) {
    for (i, card) in cards.iter_mut().enumerate() {
        card.id = i + 1;
    }
}

/// Stable identifier of one sheet in the catalog ("0".."4" by default).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SheetKey(pub String);

impl SheetKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SheetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SheetKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Answer to a destructive-operation prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Accepted,
    Declined,
}

impl Confirmation {
    pub fn from_answer(answer: &str) -> Self {
        match answer.trim().to_lowercase().as_str() {
            "y" | "yes" => Confirmation::Accepted,
            _ => Confirmation::Declined,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// User-facing message produced at the sync/edit boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            message: message.into(),
        }
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.level {
            NoticeLevel::Info => write!(f, "{}", self.message),
            NoticeLevel::Warning => write!(f, "warning: {}", self.message),
            NoticeLevel::Error => write!(f, "error: {}", self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_renumber_positions() {
        let mut cards = vec![
            Card::new(7, "a", "b", 1),
            Card::new(3, "c", "d", 2),
            Card::new(3, "e", "f", 3),
        ];
        renumber(&mut cards);
        let ids: Vec<usize> = cards.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_card_row_serializes_as_tuple() {
        let row = Card::new(1, "hello", "world", 4).to_row();
        let json = serde_json::to_string(&row).unwrap();
        assert_eq!(json, r#"["hello","world",4]"#);
    }

    #[test]
    fn test_confirmation_answers() {
        assert_eq!(Confirmation::from_answer("y"), Confirmation::Accepted);
        assert_eq!(Confirmation::from_answer(" YES "), Confirmation::Accepted);
        assert_eq!(Confirmation::from_answer(""), Confirmation::Declined);
        assert_eq!(Confirmation::from_answer("nope"), Confirmation::Declined);
    }
}
