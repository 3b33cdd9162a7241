//! The `job` subcommand.

use flow_common::db::ConnectVia;
use flow_common::logs::LogRequest;
use flow_common::prelude::*;
use flow_common::rest_api::{Client, CreateJobRequest, ListDatumQuery, ListJobQuery};
use prettytable::{cell, format::consts::FORMAT_CLEAN, row, Table};
use structopt::StructOpt;

/// `job` options.
#[derive(Debug, StructOpt)]
pub enum Opt {
    /// Run a pipeline as a one-off job.
    #[structopt(name = "create")]
    Create {
        /// The pipeline to run.
        pipeline_name: String,
    },

    /// Describe a single job, optionally blocking until it finishes.
    #[structopt(name = "inspect")]
    Inspect {
        /// The job's UUID.
        #[structopt(parse(try_from_str))]
        id: Uuid,
        /// Block until the job reaches a terminal state.
        #[structopt(long = "block")]
        block: bool,
    },

    /// List jobs, optionally restricted to one pipeline.
    #[structopt(name = "list")]
    List {
        /// Restrict to this pipeline's jobs.
        #[structopt(long = "pipeline")]
        pipeline: Option<String>,
    },

    /// Delete a job.
    #[structopt(name = "delete")]
    Delete {
        /// The job's UUID.
        #[structopt(parse(try_from_str))]
        id: Uuid,
    },

    /// Stop a running job.
    #[structopt(name = "stop")]
    Stop {
        /// The job's UUID.
        #[structopt(parse(try_from_str))]
        id: Uuid,
    },

    /// Cancel in-flight processing of datums matching every data filter.
    #[structopt(name = "restart-datum")]
    RestartDatum {
        /// The job's UUID.
        #[structopt(parse(try_from_str))]
        id: Uuid,
        /// Data filter values the cancelled datums must all match.
        data_filters: Vec<String>,
    },

    /// List a job's datums.
    #[structopt(name = "datums")]
    Datums {
        /// The job's UUID.
        #[structopt(parse(try_from_str))]
        id: Uuid,
        /// Zero-indexed page number.
        #[structopt(long = "page", default_value = "0")]
        page: i64,
        /// Datums per page. Zero means every datum.
        #[structopt(long = "page-size", default_value = "0")]
        page_size: i64,
    },

    /// Describe a single datum.
    #[structopt(name = "datum")]
    Datum {
        /// The job's UUID.
        #[structopt(parse(try_from_str))]
        id: Uuid,
        /// The datum's opaque id.
        datum_id: String,
    },

    /// Print a job's logs.
    #[structopt(name = "logs")]
    Logs {
        /// The job's UUID.
        #[structopt(parse(try_from_str))]
        id: Uuid,
        /// Restrict to lines emitted by the pipeline's master process.
        #[structopt(long = "master")]
        master_only: bool,
        /// Restrict to lines for this datum.
        #[structopt(long = "datum")]
        datum: Option<String>,
        /// Restrict to lines whose data matches every one of these filters.
        #[structopt(long = "data")]
        data_filters: Vec<String>,
        /// Tail logs as they arrive instead of printing pod-by-pod.
        #[structopt(long = "follow")]
        follow: bool,
    },
}

/// Run the `job` subcommand.
pub fn run(opt: &Opt) -> Result<()> {
    let client = Client::new(ConnectVia::Proxy)?;
    match opt {
        Opt::Create { pipeline_name } => {
            let request = CreateJobRequest {
                pipeline_name: pipeline_name.clone(),
                input_commits: HashMap::new(),
            };
            let job = client.create_job(&request)?;
            println!("{}", job.id);
            Ok(())
        }
        Opt::Inspect { id, block } => {
            let job = client.job(*id, *block)?;
            println!("{}", serde_json::to_string_pretty(&job)?);
            Ok(())
        }
        Opt::List { pipeline } => {
            let query = ListJobQuery {
                pipeline: pipeline.clone(),
                output_commit: None,
                input_commits: Vec::new(),
            };
            let jobs = client.jobs(&query)?;
            let mut table = Table::new();
            table.set_format(*FORMAT_CLEAN);
            table.add_row(row!["JOB_ID", "PIPELINE", "STATE", "PROCESSED", "FAILED"]);
            for job in jobs {
                table.add_row(row![
                    job.id,
                    &job.pipeline_name,
                    job.state,
                    job.processed,
                    job.failed
                ]);
            }
            table.printstd();
            Ok(())
        }
        Opt::Delete { id } => client.delete_job(*id),
        Opt::Stop { id } => client.stop_job(*id).map(|_| ()),
        Opt::RestartDatum { id, data_filters } => client.restart_datum(*id, data_filters),
        Opt::Datums { id, page, page_size } => {
            let query = ListDatumQuery {
                page: *page,
                page_size: *page_size,
            };
            let datums = client.datums(*id, &query)?;
            let mut table = Table::new();
            table.set_format(*FORMAT_CLEAN);
            table.add_row(row!["DATUM_ID", "OUTCOME"]);
            for datum in datums {
                table.add_row(row![&datum.datum_id, datum.outcome]);
            }
            table.printstd();
            Ok(())
        }
        Opt::Datum { id, datum_id } => {
            let detail = client.datum(*id, datum_id)?;
            println!("{}", serde_json::to_string_pretty(&detail)?);
            Ok(())
        }
        Opt::Logs {
            id,
            master_only,
            datum,
            data_filters,
            follow,
        } => {
            let request = LogRequest {
                pipeline: None,
                job: Some(*id),
                datum: datum.clone(),
                master_only: *master_only,
                data_filters: data_filters.clone(),
                follow: *follow,
            };
            client.logs(*id, &request, |msg| print!("{}", msg.message))
        }
    }
}
