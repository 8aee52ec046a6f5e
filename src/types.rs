use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifies whose aggregates are being tracked (typically a user id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope(String);

impl Scope {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single tracked item in canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>, // None for uncategorized items
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,
}

impl Item {
    pub fn new(id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            timestamp,
            category: None,
            flags: Vec::new(),
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.flags.push(flag.into());
        self
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }

    /// Category with surrounding whitespace removed; blank categories count as none.
    pub fn category_key(&self) -> Option<&str> {
        self.category
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }
}

/// Authoritative counts reported by the backend, after normalization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateSnapshot {
    pub total_count: u64,
    pub window_count: u64,
}

/// How a local delete relates to the server-side delete call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteMode {
    /// Applied before the server confirms, so the item disappears instantly.
    Optimistic,
    /// The server already confirmed; the next baseline reflects it.
    Confirmed,
    /// The optimistic delete failed server-side and must be undone.
    Reverted,
}

impl FromStr for DeleteMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "optimistic" => Ok(Self::Optimistic),
            "confirmed" => Ok(Self::Confirmed),
            "reverted" => Ok(Self::Reverted),
            other => Err(format!("unknown delete mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Add,
    Delete,
    Edit,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => f.write_str("add"),
            Self::Delete => f.write_str("delete"),
            Self::Edit => f.write_str("edit"),
        }
    }
}

/// "An item changed" signal from the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationEvent {
    Added(Item),
    Deleted { item: Item, mode: DeleteMode },
    /// `previous` is informational; edits never change counters.
    Edited { item: Item, previous: Option<Item> },
}

impl MutationEvent {
    pub fn kind(&self) -> MutationKind {
        match self {
            Self::Added(_) => MutationKind::Add,
            Self::Deleted { .. } => MutationKind::Delete,
            Self::Edited { .. } => MutationKind::Edit,
        }
    }

    pub fn item(&self) -> &Item {
        match self {
            Self::Added(item) | Self::Deleted { item, .. } | Self::Edited { item, .. } => item,
        }
    }

    /// Whether this event can move a count-type aggregate.
    pub fn changes_cardinality(&self) -> bool {
        !matches!(self, Self::Edited { .. })
    }
}

/// Values shown to the user: ledger counts plus the latest derived metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveStats {
    pub total_count: u64,
    pub window_count: u64,
    pub streak_length: u32,
    pub favorite_category: Option<String>,
    /// Only the initial load sets this; silent refreshes never do.
    pub loading: bool,
}
