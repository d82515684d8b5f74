use std::path::Path;

use crate::commands::common::{open_store, resolve_item};
use crate::error::CliError;

pub fn run_delete(id: &str, db_path: &Path) -> Result<(), CliError> {
    let store = open_store(db_path)?;
    let item_id = resolve_item(&store, id)?;

    store.delete_item(&item_id)?;
    println!("{item_id}");
    Ok(())
}
