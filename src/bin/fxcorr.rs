use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{info, trace};

use fxcorr::cluster::run_cluster;
use fxcorr::context::RunContext;
use fxcorr::control::ControlFile;
use fxcorr::error::FxcorrError;
use fxcorr::vex::Vex;

/// A distributed software FX correlator for VLBI.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Correlation control file (JSON)
    ctrl_file: PathBuf,

    /// Observation metadata: the JSON rendering of the VEX document
    #[arg(short = 'x', long)]
    vex_file: PathBuf,

    /// Number of correlator nodes to run
    #[arg(short = 'n', long, default_value_t = 2)]
    num_correlators: usize,

    /// Visit correlators in rank order instead of serving the ready queue,
    /// for reproducible runs
    #[arg(long)]
    deterministic: bool,

    /// Seed for the header randomiser, fixed for reproducible runs
    #[arg(long)]
    seed: Option<u32>,
}

fn main_with_args(args: Args) -> i32 {
    let ctrl = match ControlFile::from_file(&args.ctrl_file) {
        Ok(ctrl) => ctrl,
        Err(e) => {
            eprintln!("error reading control file: {e}");
            return 1;
        }
    };
    let vex = match std::fs::read_to_string(&args.vex_file)
        .map_err(FxcorrError::from)
        .and_then(|text| Vex::from_json(&text).map_err(FxcorrError::from))
    {
        Ok(vex) => vex,
        Err(e) => {
            eprintln!("error reading vex file: {e}");
            return 1;
        }
    };

    // A deterministic run pins the seed unless one was given explicitly.
    let seed = args.seed.unwrap_or_else(|| {
        if args.deterministic {
            1
        } else {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs() as u32)
                .unwrap_or(1)
        }
    });
    let ctx = RunContext {
        control: ctrl,
        vex,
        seed,
        deterministic: args.deterministic,
        strict_slice_accounting: false,
        clock_rate_unitless_usec_per_sec: true,
        check_interval: 100,
    };

    match run_cluster(Arc::new(ctx), args.vex_file, args.num_correlators) {
        Ok(()) => {
            info!("correlation finished");
            0
        }
        Err(e) => {
            eprintln!("correlation failed: {e}");
            1
        }
    }
}

fn main() {
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );
    trace!("start main");
    let retcode = main_with_args(Args::parse());
    trace!("end main");
    std::process::exit(retcode);
}
