//! `flowctl`: a structopt administrative CLI for the control plane,
//! talking to `flowd` over its RPC surface.

use flow_common::prelude::*;
use structopt::StructOpt;

mod cmd;

/// Command-line options, parsed using `structopt`.
#[derive(Debug, StructOpt)]
#[structopt(about = "A tool for managing data pipelines.")]
enum Opt {
    /// Database administration commands.
    #[structopt(name = "db")]
    Db {
        #[structopt(subcommand)]
        cmd: cmd::db::Opt,
    },

    /// Run a garbage-collection pass.
    #[structopt(name = "gc")]
    Gc,

    /// Job-related commands.
    #[structopt(name = "job")]
    Job {
        #[structopt(subcommand)]
        cmd: cmd::job::Opt,
    },

    /// Pipeline-related commands.
    #[structopt(name = "pipeline")]
    Pipeline {
        #[structopt(subcommand)]
        cmd: cmd::pipeline::Opt,
    },
}

fn main() -> Result<()> {
    flow_common::tracing_support::initialize_tracing();
    openssl_probe::init_ssl_cert_env_vars();
    let opt = Opt::from_args();
    tracing::debug!(?opt, "parsed arguments");

    match opt {
        Opt::Db { ref cmd } => cmd::db::run(cmd),
        Opt::Gc => cmd::gc::run(),
        Opt::Job { ref cmd } => cmd::job::run(cmd),
        Opt::Pipeline { ref cmd } => cmd::pipeline::run(cmd),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pipeline_create() {
        let opt = Opt::from_iter_safe(["flowctl", "pipeline", "create", "spec.yaml"]).unwrap();
        match opt {
            Opt::Pipeline {
                cmd: cmd::pipeline::Opt::Create { spec },
            } => assert_eq!(spec, std::path::PathBuf::from("spec.yaml")),
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn parses_job_inspect_with_block_flag() {
        let id = Uuid::new_v4();
        let opt = Opt::from_iter_safe(["flowctl", "job", "inspect", &id.to_string(), "--block"])
            .unwrap();
        match opt {
            Opt::Job {
                cmd: cmd::job::Opt::Inspect { id: parsed_id, block },
            } => {
                assert_eq!(parsed_id, id);
                assert!(block);
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn parses_gc_with_no_arguments() {
        let opt = Opt::from_iter_safe(["flowctl", "gc"]).unwrap();
        assert!(matches!(opt, Opt::Gc));
    }

    #[test]
    fn rejects_unknown_subcommand() {
        assert!(Opt::from_iter_safe(["flowctl", "bogus"]).is_err());
    }
}
