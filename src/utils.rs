use anyhow::{Context, Result, bail};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use num_format::{Locale, ToFormattedString};

use crate::config::FormattingConfig;
use crate::types::{DeleteMode, EffectiveStats, Item, MutationEvent};
use crate::window::WindowKey;

#[derive(Clone)]
pub struct NumberFormatOptions {
    pub use_comma: bool,
    pub locale: String,
}

impl From<&FormattingConfig> for NumberFormatOptions {
    fn from(formatting: &FormattingConfig) -> Self {
        Self {
            use_comma: formatting.number_comma,
            locale: formatting.locale.clone(),
        }
    }
}

/// Format a number for display. Accepts both u32 and u64.
pub fn format_number(n: impl Into<u64>, options: &NumberFormatOptions) -> String {
    let n: u64 = n.into();
    let locale = match options.locale.as_str() {
        "de" => Locale::de,
        "fr" => Locale::fr,
        "es" => Locale::es,
        "it" => Locale::it,
        "ja" => Locale::ja,
        "ko" => Locale::ko,
        "zh" => Locale::zh,
        _ => Locale::en,
    };

    if options.use_comma {
        n.to_formatted_string(&locale)
    } else {
        n.to_string()
    }
}

/// `M/D/YYYY`, with a trailing `*` when `date` is `today`.
pub fn format_date_for_display(date: NaiveDate, today: NaiveDate) -> String {
    let formatted = format!("{}/{}/{}", date.month(), date.day(), date.year());
    if date == today {
        format!("{formatted}*")
    } else {
        formatted
    }
}

/// Plain-text block printed by `stats` and after every `watch` broadcast.
pub fn render_stats(
    stats: &EffectiveStats,
    window: WindowKey,
    today: NaiveDate,
    options: &NumberFormatOptions,
) -> String {
    let mut out = String::new();
    if stats.loading {
        out.push_str("(loading…)\n");
    }
    out.push_str(&format!(
        "Total:     {}\n",
        format_number(stats.total_count, options)
    ));
    out.push_str(&format!(
        "Window:    {} (since {})\n",
        format_number(stats.window_count, options),
        format_date_for_display(window.start(), today)
    ));
    let days = if stats.streak_length == 1 { "day" } else { "days" };
    out.push_str(&format!(
        "Streak:    {} {days}\n",
        format_number(stats.streak_length, options)
    ));
    out.push_str(&format!(
        "Favorite:  {}",
        stats.favorite_category.as_deref().unwrap_or("-")
    ));
    out
}

/// One line of `watch` input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchCommand {
    Mutation(MutationEvent),
    Refresh,
    Quit,
}

/// Parse `add|delete|edit <id> <rfc3339> [arg]`, `refresh` or `quit`.
///
/// The optional argument is the category for `add`/`edit` and the delete mode
/// for `delete` (optimistic when omitted).
pub fn parse_watch_command(line: &str) -> Result<WatchCommand> {
    let mut parts = line.split_whitespace();
    let Some(verb) = parts.next() else {
        bail!("Empty command");
    };

    match verb.to_ascii_lowercase().as_str() {
        "refresh" => return Ok(WatchCommand::Refresh),
        "quit" | "exit" => return Ok(WatchCommand::Quit),
        "add" | "delete" | "edit" => {}
        other => bail!("Unknown command: {other}"),
    }

    let id = parts.next().context("Missing item id")?;
    let raw_ts = parts.next().context("Missing timestamp")?;
    let timestamp = DateTime::parse_from_rfc3339(raw_ts)
        .with_context(|| format!("Invalid RFC 3339 timestamp: {raw_ts}"))?
        .with_timezone(&Utc);
    let extra: Vec<&str> = parts.collect();
    let extra = (!extra.is_empty()).then(|| extra.join(" "));

    let item = Item::new(id, timestamp);
    let event = match verb.to_ascii_lowercase().as_str() {
        "add" => MutationEvent::Added(with_category(item, extra)),
        "edit" => MutationEvent::Edited {
            item: with_category(item, extra),
            previous: None,
        },
        _ => {
            let mode = match extra {
                Some(mode) => mode.parse::<DeleteMode>().map_err(anyhow::Error::msg)?,
                None => DeleteMode::Optimistic,
            };
            MutationEvent::Deleted { item, mode }
        }
    };
    Ok(WatchCommand::Mutation(event))
}

fn with_category(item: Item, category: Option<String>) -> Item {
    match category {
        Some(category) => item.with_category(category),
        None => item,
    }
}
