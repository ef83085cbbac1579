use anyhow::Result;

use super::Stack;
use crate::Context;
use crate::ui;

/// Preview what apply would change; reads state, never calls the platform
pub fn run(ctx: &Context) -> Result<()> {
    let stack = Stack::load(ctx)?;
    let plan = declarative::plan(&stack.specs, &stack.variables, &stack.store)?;

    log::info!(
        "{} resources in {} waves",
        plan.order().len(),
        plan.waves().len()
    );
    ui::display_plan(&plan);
    Ok(())
}
