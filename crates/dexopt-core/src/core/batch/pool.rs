use std::sync::{mpsc, Mutex, PoisonError};
use std::thread;

use dexopt_domain::{
    DexFileDexoptResult, DexoptParams, DexoptStatus, PackageDexoptResult, PackageSnapshot,
    PackageState,
};
use tracing::{error, warn};

use crate::core::cancel::CancellationSignal;
use crate::core::effects::CompilerDriver;

pub(crate) struct PassInputs<'a> {
    pub(crate) compiler: &'a dyn CompilerDriver,
    pub(crate) snapshot: &'a PackageSnapshot,
    pub(crate) params: &'a DexoptParams,
    pub(crate) cancel: &'a CancellationSignal,
    pub(crate) concurrency: usize,
}

/// Compiles `packages` on up to `concurrency` workers and returns results in input order.
///
/// Workers stop picking up packages once `cancel` fires; every package never started is
/// reported as cancelled.
pub(crate) fn dexopt_all(inputs: &PassInputs<'_>, packages: &[String]) -> Vec<PackageDexoptResult> {
    if packages.is_empty() {
        return Vec::new();
    }
    let worker_count = inputs.concurrency.clamp(1, packages.len());
    let (job_tx, job_rx) = mpsc::channel();
    for job in packages.iter().enumerate() {
        if job_tx.send(job).is_err() {
            break;
        }
    }
    drop(job_tx);

    let job_rx = Mutex::new(job_rx);
    let (result_tx, result_rx) = mpsc::channel();
    thread::scope(|scope| {
        for _ in 0..worker_count {
            let work_rx = &job_rx;
            let result_tx = result_tx.clone();
            scope.spawn(move || loop {
                let (index, name) = {
                    let guard = work_rx.lock().unwrap_or_else(PoisonError::into_inner);
                    match guard.recv() {
                        Ok(job) => job,
                        Err(_) => break,
                    }
                };
                if inputs.cancel.is_cancelled() {
                    break;
                }
                let outcome = dexopt_one(inputs, name);
                if result_tx.send((index, outcome)).is_err() {
                    break;
                }
            });
        }
    });
    drop(result_tx);

    let mut slots: Vec<Option<PackageDexoptResult>> = vec![None; packages.len()];
    for (index, outcome) in result_rx {
        if let Some(slot) = slots.get_mut(index) {
            *slot = Some(outcome);
        }
    }
    slots
        .into_iter()
        .zip(packages)
        .map(|(outcome, name)| {
            outcome.unwrap_or_else(|| PackageDexoptResult::cancelled(name.clone()))
        })
        .collect()
}

fn dexopt_one(inputs: &PassInputs<'_>, name: &str) -> PackageDexoptResult {
    let Some(package) = inputs.snapshot.package_state(name) else {
        warn!(package = name, "package is not installed, skipping");
        return PackageDexoptResult::from_files(name, Vec::new());
    };
    let mut params = inputs.params.clone();
    params.compiler_filter = inputs.params.filter_for(name);
    match inputs.compiler.dexopt(package, &params, inputs.cancel) {
        Ok(result) => result,
        Err(err) => {
            error!(
                package = name,
                reason = %params.reason,
                "dexopt failed: {err:#}"
            );
            failed(package, &params)
        }
    }
}

fn failed(package: &PackageState, params: &DexoptParams) -> PackageDexoptResult {
    let files = package
        .splits
        .iter()
        .map(|split| DexFileDexoptResult {
            dex_path: split.path.clone(),
            abi: package.primary_abi.clone().unwrap_or_default(),
            actual_compiler_filter: params.compiler_filter,
            status: DexoptStatus::Failed,
            wall_time_ms: 0,
            size_bytes: 0,
            size_before_bytes: 0,
        })
        .collect();
    PackageDexoptResult {
        package_name: package.name.clone(),
        status: DexoptStatus::Failed,
        files,
    }
}
