//! The `pipeline` subcommand.

use std::{fs::File, path::PathBuf};

use flow_common::db::ConnectVia;
use flow_common::prelude::*;
use flow_common::rest_api::Client;
use prettytable::{cell, format::consts::FORMAT_CLEAN, row, Table};
use structopt::StructOpt;

/// `pipeline` options.
#[derive(Debug, StructOpt)]
pub enum Opt {
    /// Create a pipeline from a JSON or YAML spec file.
    #[structopt(name = "create")]
    Create {
        /// Path to the pipeline spec.
        #[structopt(parse(from_os_str))]
        spec: PathBuf,
    },

    /// Update an existing pipeline from a JSON or YAML spec file.
    #[structopt(name = "update")]
    Update {
        /// The pipeline to update.
        name: String,
        /// Path to the new pipeline spec.
        #[structopt(parse(from_os_str))]
        spec: PathBuf,
        /// Mint a fresh salt, discarding incremental cache reuse.
        #[structopt(long = "reprocess")]
        reprocess: bool,
    },

    /// Describe a single pipeline.
    #[structopt(name = "inspect")]
    Inspect {
        /// The pipeline to describe.
        name: String,
    },

    /// List every pipeline.
    #[structopt(name = "list")]
    List,

    /// Delete a pipeline and its jobs.
    #[structopt(name = "delete")]
    Delete {
        /// The pipeline to delete.
        name: String,
    },

    /// Resume a paused pipeline.
    #[structopt(name = "start")]
    Start {
        /// The pipeline to start.
        name: String,
    },

    /// Pause a running pipeline.
    #[structopt(name = "stop")]
    Stop {
        /// The pipeline to stop.
        name: String,
    },
}

fn read_spec(path: &PathBuf) -> Result<PipelineSpec> {
    let f = File::open(path).with_context(|| format!("can't open {}", path.display()))?;
    serde_yaml::from_reader(f).with_context(|| format!("can't parse {}", path.display()))
}

fn print_pipeline(info: &PipelineInfo) {
    let mut table = Table::new();
    table.set_format(*FORMAT_CLEAN);
    table.add_row(row!["NAME", "VERSION", "STATE", "CREATED_AT"]);
    table.add_row(row![
        &info.spec.name,
        info.spec.version,
        info.state,
        info.spec.created_at
    ]);
    table.printstd();
}

/// Run the `pipeline` subcommand.
pub fn run(opt: &Opt) -> Result<()> {
    let client = Client::new(ConnectVia::Proxy)?;
    match opt {
        Opt::Create { spec } => {
            let spec = read_spec(spec)?;
            let info = client.create_pipeline(&spec)?;
            print_pipeline(&info);
            Ok(())
        }
        Opt::Update {
            name,
            spec,
            reprocess,
        } => {
            let spec = read_spec(spec)?;
            let info = client.update_pipeline(name, &spec, *reprocess)?;
            print_pipeline(&info);
            Ok(())
        }
        Opt::Inspect { name } => {
            let info = client.pipeline(name)?;
            println!("{}", serde_json::to_string_pretty(&info)?);
            Ok(())
        }
        Opt::List => {
            let infos = client.pipelines()?;
            let mut table = Table::new();
            table.set_format(*FORMAT_CLEAN);
            table.add_row(row!["NAME", "VERSION", "STATE", "CREATED_AT"]);
            for info in infos {
                table.add_row(row![
                    &info.spec.name,
                    info.spec.version,
                    info.state,
                    info.spec.created_at
                ]);
            }
            table.printstd();
            Ok(())
        }
        Opt::Delete { name } => client.delete_pipeline(name),
        Opt::Start { name } => client.start_pipeline(name),
        Opt::Stop { name } => client.stop_pipeline(name),
    }
}
