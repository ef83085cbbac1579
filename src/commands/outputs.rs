use anyhow::{Context as AnyhowContext, Result};

use super::open_state_dir;
use crate::Context;
use crate::state::FileStateStore;
use crate::topology;
use crate::ui;

pub fn run(ctx: &Context, json: bool) -> Result<()> {
    let store = FileStateStore::open(open_state_dir(ctx)?)?;
    let outputs = topology::outputs(&store)?;

    if json {
        let rendered = serde_json::to_string_pretty(&outputs).context("Failed to serialize outputs")?;
        println!("{rendered}");
    } else {
        ui::display_outputs(&outputs);
    }
    Ok(())
}
