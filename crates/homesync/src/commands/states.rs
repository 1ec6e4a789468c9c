//! `homesync states`: one-shot hydration and dump.

use crate::cli::GlobalOpts;
use crate::error::CliError;
use crate::output;

pub async fn handle(global: &GlobalOpts) -> Result<(), CliError> {
    let store = super::connect_store(global, false).await?;

    let result = store.sync_from_ha().await;
    store.client().disconnect().await;
    let report = result?;
    tracing::debug!(?report, "hydrated");

    let rendered = output::render_states(global.output, store.catalog(), &store.get_all_values())?;
    println!("{rendered}");
    Ok(())
}
