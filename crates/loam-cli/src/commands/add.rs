use std::path::Path;

use crate::commands::common::{open_store, resolve_body, resolve_parent};
use crate::error::CliError;

pub fn run_add(
    title: &str,
    body_parts: &[String],
    parent: Option<&str>,
    db_path: &Path,
) -> Result<(), CliError> {
    let body = resolve_body(body_parts)?;

    let store = open_store(db_path)?;
    let parent_id = resolve_parent(&store, parent)?;
    let note = store.create_note(parent_id, title, &body)?;

    println!("{}", note.id);
    Ok(())
}

pub fn run_mkdir(title: &str, parent: Option<&str>, db_path: &Path) -> Result<(), CliError> {
    let store = open_store(db_path)?;
    let parent_id = resolve_parent(&store, parent)?;
    let folder = store.create_folder(parent_id, title)?;

    println!("{}", folder.id);
    Ok(())
}

pub fn run_attach(
    file: &Path,
    title: Option<&str>,
    parent: Option<&str>,
    db_path: &Path,
) -> Result<(), CliError> {
    let data = std::fs::read(file)?;
    let title = title.map_or_else(
        || {
            file.file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default()
        },
        ToString::to_string,
    );

    let store = open_store(db_path)?;
    let parent_id = resolve_parent(&store, parent)?;
    let resource = store.create_resource(parent_id, &title, &data)?;

    println!("{}", resource.id);
    Ok(())
}
