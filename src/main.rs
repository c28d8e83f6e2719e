use std::{
    env,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::Context;
use hyper_gradient::{config::RunSpec, runner};
use log::info;
use tokio::{signal, task};

const SPEC_VAR: &str = "HYPERGRAD_SPEC";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let spec = match env::var(SPEC_VAR) {
        Ok(path) => {
            info!("reading run spec from {path}");
            RunSpec::from_json_file(&path).with_context(|| format!("{SPEC_VAR}={path}"))?
        }
        Err(_) => RunSpec::default(),
    };

    let stop = Arc::new(AtomicBool::new(false));
    let mut run = task::spawn_blocking({
        let stop = Arc::clone(&stop);
        move || runner::run(spec, &stop)
    });

    let summary = tokio::select! {
        ret = &mut run => ret.context("training task panicked")??,
        _ = signal::ctrl_c() => {
            info!("received SIGTERM, finishing the current batch");
            stop.store(true, Ordering::Relaxed);
            run.await.context("training task panicked")??
        }
    };

    info!(
        epochs = summary.epochs,
        samples = summary.contributions.len();
        "run {} finished, hyper-gradients at {}",
        summary.run_id,
        summary.hyper_dir.display()
    );

    Ok(())
}
