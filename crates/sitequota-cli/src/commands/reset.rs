//! Reset command

use anyhow::{bail, Result};

use super::Context;
use crate::output::print_success;

pub async fn execute(ctx: &Context) -> Result<()> {
    if !ctx.engine.force_reset().await {
        bail!("Failed to reset daily counters, the database could not be updated");
    }
    print_success("Daily counters reset", ctx.quiet);
    Ok(())
}
