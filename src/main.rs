//! `ddsg` binary entry point.

use clap::Parser;
use env_logger::Env;
use std::process;

use ddsg::config::Config;
use ddsg::{CliArgs, Coordinator};

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("warn")).init();

    let args = CliArgs::parse();

    let cfg = match Config::from_args(&args) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("ddsg: configuration error: {e}");
            process::exit(1);
        }
    };

    log::info!(
        "copying bs={} bpt={} count={:?} thr={} cdbsz={}",
        cfg.bs,
        cfg.bpt,
        cfg.count,
        cfg.thr,
        cfg.cdbsz
    );

    let coordinator = match Coordinator::new(cfg) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("ddsg: setup error: {e}");
            process::exit(e.exit_code());
        }
    };

    match coordinator.run() {
        Ok(report) => {
            log::debug!("{}", report.report_line);
            process::exit(report.exit_code);
        }
        Err(e) => {
            eprintln!("ddsg: {e}");
            process::exit(e.exit_code());
        }
    }
}
