//! `homesync run`: follow the hub until interrupted.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::GlobalOpts;
use crate::error::CliError;

pub async fn handle(global: &GlobalOpts) -> Result<(), CliError> {
    let store = super::connect_store(global, true).await?;

    // Subscribe before the first sync so hydration is logged too.
    let subscriptions = store
        .catalog()
        .iter()
        .map(|var| {
            store.subscribe(var.key, |key, old, new| match old {
                Some(old) => info!(key, %old, %new, "state changed"),
                None => info!(key, %new, "state initialized"),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let report = store.sync_from_ha().await?;
    if report.missing > 0 || report.failed > 0 {
        warn!(
            missing = report.missing,
            failed = report.failed,
            "some variables are not backed by the hub yet"
        );
    }

    let cancel = CancellationToken::new();
    let resync = store.spawn_resync(cancel.clone());

    info!("following hub changes, press Ctrl-C to stop");
    let signal = tokio::signal::ctrl_c().await;

    info!("shutting down");
    cancel.cancel();
    if let Err(e) = resync.await {
        warn!(error = %e, "resync task ended abnormally");
    }
    for sub in &subscriptions {
        sub.unsubscribe();
    }
    store.client().disconnect().await;

    signal?;
    Ok(())
}
