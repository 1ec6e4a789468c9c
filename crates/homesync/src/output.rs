//! Output formatting: table or JSON.

use std::collections::BTreeMap;

use tabled::{Table, Tabled, settings::Style};

use homesync_core::{Catalog, StateValue};

use crate::cli::OutputFormat;
use crate::error::CliError;

#[derive(Tabled)]
struct StateRow {
    #[tabled(rename = "Key")]
    key: &'static str,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Entity")]
    entity: &'static str,
    #[tabled(rename = "Value")]
    value: String,
}

/// Render a snapshot of the cache.
///
/// JSON emits only initialized values, keyed by variable name. The table
/// lists the whole catalog so uninitialized variables show up as `-`.
pub fn render_states(
    format: OutputFormat,
    catalog: &Catalog,
    values: &BTreeMap<String, StateValue>,
) -> Result<String, CliError> {
    match format {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(values)?),
        OutputFormat::Table => {
            let rows: Vec<StateRow> = catalog
                .iter()
                .map(|var| StateRow {
                    key: var.key,
                    kind: var.kind().to_string(),
                    entity: var.entity_id.unwrap_or("(local)"),
                    value: values
                        .get(var.key)
                        .map_or_else(|| "-".to_owned(), ToString::to_string),
                })
                .collect();
            Ok(render_table(&rows))
        }
    }
}

fn render_table<R: Tabled>(rows: &[R]) -> String {
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    table.to_string()
}
