//! The `gc` subcommand.

use flow_common::db::ConnectVia;
use flow_common::prelude::*;
use flow_common::rest_api::Client;

/// Run a garbage-collection pass and print the report.
pub fn run() -> Result<()> {
    let client = Client::new(ConnectVia::Proxy)?;
    let report = client.garbage_collect()?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
