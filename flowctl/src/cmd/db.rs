//! The `db` subcommand.

use flow_common::db::{self, ConnectVia};
use flow_common::prelude::*;
use structopt::StructOpt;

/// `db` options.
#[derive(Debug, StructOpt)]
pub enum Opt {
    /// Apply any pending schema migrations.
    #[structopt(name = "migrate")]
    Migrate,
}

/// Run the `db` subcommand.
pub fn run(opt: &Opt) -> Result<()> {
    match opt {
        Opt::Migrate => {
            let mut conn = db::connect(ConnectVia::Proxy)?;
            db::run_pending_migrations(&mut conn)
        }
    }
}
