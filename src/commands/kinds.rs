use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

use crate::Context;
use crate::config::ConvergeConfig;
use crate::kinds;
use crate::store::FileStore;
use crate::ui;

/// List resource kinds in the order a deploy runs them
pub fn run(ctx: &Context) -> Result<()> {
    let dir = Path::new(".");
    let config = ConvergeConfig::load(dir)?;
    let store = Arc::new(FileStore::open(&config.store_path(dir))?);
    let registry = kinds::registry(&store)?;
    let order = registry.deployment_order()?;

    ui::header("Resource kinds");
    let total = order.len();
    for (i, kind) in order.into_iter().enumerate() {
        ui::step(i + 1, total, kind.kind());
        if ctx.quiet {
            continue;
        }
        ui::kv("folder", kind.folder());
        if !kind.depends_on_kinds().is_empty() {
            ui::kv("after", &kind.depends_on_kinds().join(", "));
        }
    }
    Ok(())
}
