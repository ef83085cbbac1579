//! Command implementations

pub mod apply;
pub mod outputs;
pub mod plan;
pub mod state;

use anyhow::{Context as AnyhowContext, Result};
use declarative::{ResourceSpec, Variables};
use std::path::PathBuf;

use crate::Context;
use crate::config::{self, StackConfig};
use crate::state::FileStateStore;
use crate::topology;

/// Everything a command needs: the graph, its variables and the state store
pub struct Stack {
    pub specs: Vec<ResourceSpec>,
    pub variables: Variables,
    pub store: FileStateStore,
    pub state_dir: PathBuf,
}

impl Stack {
    /// Load the config and open the state directory
    pub fn load(ctx: &Context) -> Result<Self> {
        let path = config::locate(&ctx.config);
        let config = StackConfig::load(&path)?;
        let state_dir = open_state_dir(ctx)?;
        Ok(Self {
            specs: topology::build(&config),
            variables: config.variables(),
            store: FileStateStore::open(&state_dir)?,
            state_dir,
        })
    }
}

/// Open the state directory without needing a config
pub fn open_state_dir(ctx: &Context) -> Result<PathBuf> {
    let dir = config::expand(&ctx.state_dir);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create state directory: {}", dir.display()))?;
    Ok(dir)
}
