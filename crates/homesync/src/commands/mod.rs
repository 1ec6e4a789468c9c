//! Command handlers and the shared hub bootstrap.

pub mod config_cmd;
pub mod run;
pub mod states;

use homesync_api::HubClient;
use homesync_core::{Catalog, StateStore};
use tracing::info;

use crate::cli::GlobalOpts;
use crate::error::CliError;

/// Load the config, connect to the hub and wrap the client in a store
/// over the standard catalog. `--read-only` only ever tightens the
/// configured policy.
pub async fn connect_store(
    global: &GlobalOpts,
    auto_reconnect: bool,
) -> Result<StateStore, CliError> {
    let config = homesync_config::load_config(global.config.as_deref())?;
    let mut client_config = homesync_config::client_config(&config)?;
    client_config.auto_reconnect = auto_reconnect;

    let url = client_config.url.to_string();
    let client = HubClient::new(client_config);
    client
        .connect()
        .await
        .map_err(|e| CliError::from_connect(e, &url))?;

    let read_only = config.read_only || global.read_only;
    info!(url = %url, read_only, "connected to hub");
    Ok(StateStore::new(client, Catalog::standard(), read_only))
}
