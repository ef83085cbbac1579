use anyhow::Result;

use super::open_state_dir;
use crate::Context;
use crate::state::FileStateStore;
use crate::ui;

/// List recorded resources
pub fn run(ctx: &Context) -> Result<()> {
    let store = FileStateStore::open(open_state_dir(ctx)?)?;
    let records: Vec<_> = store.records()?.into_values().collect();

    if !ctx.quiet {
        ui::kv("State file", &store.path().display().to_string());
    }
    ui::display_state(&records);
    Ok(())
}
