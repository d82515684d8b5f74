use std::path::Path;

use loam_core::db::LocalItemStore;
use loam_core::{Error, ItemType};

use crate::commands::common::{
    capture_editor_input_with_initial, open_store, resolve_item, resolve_parent,
};
use crate::error::CliError;

pub fn run_edit(
    id: &str,
    title: Option<&str>,
    body: Option<&str>,
    db_path: &Path,
) -> Result<(), CliError> {
    let store = open_store(db_path)?;
    let item_id = resolve_item(&store, id)?;
    let item = store
        .get_item(&item_id)?
        .ok_or_else(|| Error::NotFound(item_id.to_string()))?;

    let edited_body;
    let body = match (title, body) {
        (None, None) if item.item_type == ItemType::Note => {
            edited_body = capture_editor_input_with_initial(&item.body)?;
            if edited_body == item.body {
                println!("{}", item.id);
                return Ok(());
            }
            Some(edited_body.as_str())
        }
        _ => body,
    };

    let updated = store.update_item(&item.id, title, body)?;
    println!("{}", updated.id);
    Ok(())
}

pub fn run_move(id: &str, to: Option<&str>, db_path: &Path) -> Result<(), CliError> {
    let store = open_store(db_path)?;
    let item_id = resolve_item(&store, id)?;
    let parent_id = resolve_parent(&store, to)?;

    let moved = store.move_item(&item_id, parent_id)?;
    println!("{}", moved.id);
    Ok(())
}
