//! Text format used for items stored at a remote target.
//!
//! ```text
//! Title
//!
//! Body text, any number of lines
//!
//! id: 0190c0e5b1e87b3c9b9f3a7c2d1e4f56
//! parent_id:
//! created_time: 2024-06-01T10:00:00.000Z
//! updated_time: 2024-06-01T10:05:00.000Z
//! encryption_applied: 0
//! is_conflict: 0
//! type_: 1
//! ```
//!
//! Metadata is read from the end of the payload up to the first blank line,
//! so bodies may contain `key: value` lines of their own.

use std::collections::HashMap;
use std::sync::OnceLock;

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;

use super::item::normalize_title;
use super::{Item, ItemId, ItemType};
use crate::error::{Error, Result};

/// Serialize an item into its remote text form
pub fn serialize_item(item: &Item) -> String {
    let mut output = normalize_title(&item.title);
    if !item.body.is_empty() {
        output.push_str("\n\n");
        output.push_str(&item.body);
    }

    let parent_id = item.parent_id.map(|id| id.to_string()).unwrap_or_default();
    let metadata = [
        ("id", item.id.to_string()),
        ("parent_id", parent_id),
        ("created_time", format_time(item.created_time)),
        ("updated_time", format_time(item.updated_time)),
        ("encryption_applied", flag(item.encryption_applied)),
        ("is_conflict", flag(item.is_conflict)),
        ("type_", item.item_type.code().to_string()),
    ];

    output.push_str("\n\n");
    let lines = metadata
        .iter()
        .map(|(key, value)| {
            if value.is_empty() {
                format!("{key}:")
            } else {
                format!("{key}: {value}")
            }
        })
        .collect::<Vec<_>>();
    output.push_str(&lines.join("\n"));
    output
}

/// Parse an item from its remote text form
pub fn deserialize_item(raw: &str) -> Result<Item> {
    let raw = raw.replace("\r\n", "\n");
    let lines = raw.trim_end_matches('\n').split('\n').collect::<Vec<_>>();

    let mut metadata = HashMap::new();
    let mut split_at = lines.len();
    for (index, line) in lines.iter().enumerate().rev() {
        if line.trim().is_empty() {
            split_at = index;
            break;
        }
        let captures = metadata_line_regex()
            .captures(line)
            .ok_or_else(|| Error::InvalidPayload(format!("Invalid metadata line: {line}")))?;
        metadata.insert(captures[1].to_string(), captures[2].trim().to_string());
        split_at = index;
    }

    let text = &lines[..split_at];
    let title = text.first().map(|line| line.trim()).unwrap_or_default();
    let body = if text.len() > 2 {
        text[2..].join("\n")
    } else {
        String::new()
    };

    let id = required(&metadata, "id")?
        .parse::<ItemId>()
        .map_err(|error| Error::InvalidPayload(format!("Invalid id: {error}")))?;
    let item_type = required(&metadata, "type_")?
        .parse::<i64>()
        .map_err(|error| Error::InvalidPayload(format!("Invalid type_: {error}")))
        .and_then(ItemType::from_code)?;
    let parent_id = match metadata.get("parent_id").map(String::as_str) {
        None | Some("") => None,
        Some(value) => Some(
            value
                .parse::<ItemId>()
                .map_err(|error| Error::InvalidPayload(format!("Invalid parent_id: {error}")))?,
        ),
    };
    let updated_time = parse_time(required(&metadata, "updated_time")?)?;
    let created_time = metadata
        .get("created_time")
        .map(|value| parse_time(value))
        .transpose()?
        .unwrap_or(updated_time);

    Ok(Item {
        id,
        item_type,
        parent_id,
        title: title.to_string(),
        body,
        created_time,
        updated_time,
        encryption_applied: parse_flag(metadata.get("encryption_applied")),
        is_conflict: parse_flag(metadata.get("is_conflict")),
        revision: 0,
    })
}

fn metadata_line_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^([a-z_]+):(.*)$").expect("Invalid regex"))
}

fn required<'a>(metadata: &'a HashMap<String, String>, key: &str) -> Result<&'a str> {
    metadata
        .get(key)
        .map(String::as_str)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| Error::InvalidPayload(format!("Missing metadata field: {key}")))
}

fn format_time(timestamp_ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(timestamp_ms)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_time(value: &str) -> Result<i64> {
    DateTime::parse_from_rfc3339(value)
        .map(|date_time| date_time.timestamp_millis())
        .map_err(|error| Error::InvalidPayload(format!("Invalid timestamp '{value}': {error}")))
}

fn flag(value: bool) -> String {
    if value { "1" } else { "0" }.to_string()
}

fn parse_flag(value: Option<&String>) -> bool {
    matches!(value.map(String::as_str), Some("1" | "true"))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn fixed_note() -> Item {
        let mut note = Item::note("Shopping", "milk\n\nurl: https://example.com\nend");
        note.created_time = 1_717_236_000_000;
        note.updated_time = 1_717_236_300_123;
        note.parent_id = Some(ItemId::new());
        note
    }

    #[test]
    fn serialized_note_parses_back() {
        let note = fixed_note();
        let parsed = deserialize_item(&serialize_item(&note)).unwrap();
        assert_eq!(parsed, note);
    }

    #[test]
    fn folder_without_body_parses_back() {
        let mut folder = Item::folder("Projects");
        folder.updated_time = 1_700_000_000_000;
        folder.created_time = 1_700_000_000_000;

        let serialized = serialize_item(&folder);
        assert!(serialized.starts_with("Projects\n\nid: "));
        assert!(serialized.contains("\nparent_id:\n"));

        let parsed = deserialize_item(&serialized).unwrap();
        assert_eq!(parsed, folder);
    }

    #[test]
    fn conflict_flag_is_preserved() {
        let mut note = fixed_note();
        note.is_conflict = true;
        note.encryption_applied = true;

        let parsed = deserialize_item(&serialize_item(&note)).unwrap();
        assert!(parsed.is_conflict);
        assert!(parsed.encryption_applied);
    }

    #[test]
    fn missing_id_is_rejected() {
        let err = deserialize_item("Title\n\ntype_: 1\nupdated_time: 2024-01-01T00:00:00Z")
            .unwrap_err();
        match err {
            Error::InvalidPayload(message) => assert!(message.contains("id")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(deserialize_item("just some text").is_err());
    }

    #[test]
    fn crlf_payloads_are_accepted() {
        let note = fixed_note();
        let windows = serialize_item(&note).replace('\n', "\r\n");
        let parsed = deserialize_item(&windows).unwrap();
        assert_eq!(parsed.id, note.id);
        assert_eq!(parsed.updated_time, note.updated_time);
    }
}
