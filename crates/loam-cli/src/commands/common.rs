use std::env;
use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::Utc;
use loam_core::config::TargetUri;
use loam_core::db::SqliteItemStore;
use loam_core::models::SyncConflict;
use loam_core::{Item, ItemId};
use serde::Serialize;

use crate::config_profiles::{normalize_text_option, CliProfilesConfig};
use crate::error::CliError;

pub const ENV_DB_PATH: &str = "LOAM_DB_PATH";
pub const ENV_TARGET: &str = "LOAM_TARGET";

#[derive(Debug, Serialize)]
pub struct ItemListItem {
    pub id: String,
    pub item_type: String,
    pub parent_id: Option<String>,
    pub title: String,
    pub preview: String,
    pub created_time: i64,
    pub updated_time: i64,
    pub relative_time: String,
    pub is_conflict: bool,
}

#[derive(Debug, Serialize)]
pub struct SyncConflictItem {
    pub id: i64,
    pub target_id: String,
    pub item_id: String,
    pub conflict_item_id: Option<String>,
    pub local_updated_time: i64,
    pub remote_updated_time: i64,
    pub resolved_at: i64,
    pub resolved_at_iso: String,
    pub strategy: String,
}

/// Global options every command may need
pub struct Context {
    pub db_path: PathBuf,
    pub profile: Option<String>,
    pub target: Option<String>,
}

impl Context {
    pub fn open_store(&self) -> Result<SqliteItemStore, CliError> {
        open_store(&self.db_path)
    }

    pub fn resolve_target(&self) -> Result<TargetUri, CliError> {
        resolve_target(self.target.as_deref(), self.profile.as_deref())
    }
}

pub fn open_store(path: &Path) -> Result<SqliteItemStore, CliError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(SqliteItemStore::open(path)?)
}

/// `--target`, then `LOAM_TARGET`, then the profile's target
pub fn resolve_target(
    explicit: Option<&str>,
    profile: Option<&str>,
) -> Result<TargetUri, CliError> {
    if let Some(raw) = normalize_text_option(explicit.map(ToString::to_string))
        .or_else(|| normalize_text_option(env::var(ENV_TARGET).ok()))
    {
        return Ok(TargetUri::parse(&raw)?);
    }

    let config = CliProfilesConfig::load()?;
    let profile_name = config.resolve_profile_name(profile);
    let raw = config
        .profile(&profile_name)
        .and_then(|profile| profile.target())
        .ok_or(CliError::TargetNotConfigured)?;
    tracing::debug!(profile = %profile_name, "Using sync target from profile");
    Ok(TargetUri::parse(&raw)?)
}

pub fn resolve_item(store: &SqliteItemStore, query: &str) -> Result<ItemId, CliError> {
    let query = normalize_item_identifier(query)?;
    Ok(store.resolve_item_id(&query)?)
}

pub fn resolve_parent(
    store: &SqliteItemStore,
    query: Option<&str>,
) -> Result<Option<ItemId>, CliError> {
    query.map(|query| resolve_item(store, query)).transpose()
}

pub fn short_id(id: &ItemId) -> String {
    id.to_string().chars().take(8).collect()
}

pub fn format_item_lines(items: &[Item]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    items
        .iter()
        .map(|item| {
            let title = truncate(&item.title, 40);
            let relative_time = format_relative_time(item.updated_time, now_ms);
            let marker = if item.is_conflict { "  [conflict]" } else { "" };
            format!(
                "{:<8}  {:<8}  {title:<40}  {relative_time}{marker}",
                short_id(&item.id),
                item.item_type.as_str(),
            )
        })
        .collect()
}

pub fn item_to_list_item(item: &Item) -> ItemListItem {
    let now_ms = Utc::now().timestamp_millis();
    ItemListItem {
        id: item.id.to_string(),
        item_type: item.item_type.as_str().to_string(),
        parent_id: item.parent_id.map(|id| id.to_string()),
        title: item.title.clone(),
        preview: truncate(&item.body_preview(200), 80),
        created_time: item.created_time,
        updated_time: item.updated_time,
        relative_time: format_relative_time(item.updated_time, now_ms),
        is_conflict: item.is_conflict,
    }
}

pub fn sync_conflict_to_item(conflict: &SyncConflict) -> SyncConflictItem {
    SyncConflictItem {
        id: conflict.id,
        target_id: conflict.target_id.clone(),
        item_id: conflict.item_id.clone(),
        conflict_item_id: conflict.conflict_item_id.clone(),
        local_updated_time: conflict.local_updated_time,
        remote_updated_time: conflict.remote_updated_time,
        resolved_at: conflict.resolved_at,
        resolved_at_iso: format_sync_timestamp(conflict.resolved_at),
        strategy: conflict.strategy.as_str().to_string(),
    }
}

pub fn format_sync_conflict_lines(conflicts: &[SyncConflict]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            let copy = conflict
                .conflict_item_id
                .as_deref()
                .map(|id| format!("  copy={id}"))
                .unwrap_or_default();
            format!(
                "{}  {:<20}  item={}  local={} remote={}{copy}",
                format_sync_timestamp(conflict.resolved_at),
                conflict.strategy.as_str(),
                conflict.item_id,
                conflict.local_updated_time,
                conflict.remote_updated_time,
            )
        })
        .collect()
}

pub fn format_sync_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

const MINUTE_MS: i64 = 60_000;
const DAY_MS: i64 = 24 * 60 * MINUTE_MS;

/// Largest unit first
const RELATIVE_UNITS: [(i64, &str); 6] = [
    (365 * DAY_MS, "y"),
    (30 * DAY_MS, "mo"),
    (7 * DAY_MS, "w"),
    (DAY_MS, "d"),
    (60 * MINUTE_MS, "h"),
    (MINUTE_MS, "m"),
];

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let elapsed = now_ms.saturating_sub(timestamp_ms);
    RELATIVE_UNITS
        .iter()
        .find(|(unit, _)| elapsed >= *unit)
        .map_or_else(
            || "just now".to_string(),
            |(unit, suffix)| format!("{}{suffix} ago", elapsed / unit),
        )
}

pub fn truncate(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        collapsed
    } else {
        let mut truncated = collapsed
            .chars()
            .take(max_chars.saturating_sub(3))
            .collect::<String>();
        truncated.push_str("...");
        truncated
    }
}

/// Body from the arguments, else from piped stdin, else empty
pub fn resolve_body(body_parts: &[String]) -> Result<String, CliError> {
    if !body_parts.is_empty() {
        return Ok(body_parts.join(" "));
    }
    Ok(read_piped_stdin()?.unwrap_or_default())
}

pub fn normalize_item_identifier(id: &str) -> Result<String, CliError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        Err(CliError::EmptyItemId)
    } else {
        Ok(trimmed.to_string())
    }
}

pub fn read_piped_stdin() -> Result<Option<String>, CliError> {
    let stdin = io::stdin();
    if stdin.is_terminal() {
        return Ok(None);
    }

    let mut buffer = String::new();
    stdin.lock().read_to_string(&mut buffer)?;
    Ok(Some(buffer))
}

pub fn capture_editor_input_with_initial(initial_content: &str) -> Result<String, CliError> {
    let editor = preferred_editor();
    let temp_file = create_temp_note_file_path();
    std::fs::write(&temp_file, initial_content)?;

    let launch_result = launch_editor(&editor, &temp_file);
    let content = std::fs::read_to_string(&temp_file)?;
    let _ = std::fs::remove_file(&temp_file);

    launch_result?;
    Ok(content)
}

pub fn launch_editor(editor: &str, file_path: &Path) -> Result<(), CliError> {
    let status = match Command::new(editor).arg(file_path).status() {
        Ok(status) => status,
        // EDITOR may carry arguments, e.g. "code --wait"
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            let mut parts = editor.split_whitespace();
            let Some(program) = parts.next() else {
                return Err(CliError::EditorFailed("empty EDITOR command".into()));
            };
            Command::new(program).args(parts).arg(file_path).status()?
        }
        Err(err) => return Err(CliError::Io(err)),
    };

    if status.success() {
        Ok(())
    } else {
        Err(CliError::EditorFailed(format!(
            "`{editor}` exited with status {status}"
        )))
    }
}

pub fn preferred_editor() -> String {
    env::var("VISUAL")
        .or_else(|_| env::var("EDITOR"))
        .unwrap_or_else(|_| default_editor().to_string())
}

pub const fn default_editor() -> &'static str {
    if cfg!(windows) {
        "notepad"
    } else {
        "vi"
    }
}

fn create_temp_note_file_path() -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_nanos());
    env::temp_dir().join(format!("loam-note-{}-{now}.md", std::process::id()))
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os(ENV_DB_PATH).map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("loam")
        .join("loam.db")
}
