//! Picks packages for a dexopt reason and runs the downgrade, main and supplementary passes.

mod pool;
mod selection;


use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::Result;
use dexopt_domain::{
    BatchPass, CompilerFilter, DexoptParams, DexoptReason, DexoptResult, PackageSnapshot,
};
use tracing::{debug, info, warn};

use crate::core::cancel::CancellationSignal;
use crate::core::config::BatchConfig;
use crate::core::dex_use::DexUseStore;
use crate::core::effects::{Clock, CompilerDriver, Effects, StorageProbe};
use crate::core::error::DexoptError;
use crate::core::tooling::timings::{Stopwatch, Timed};
use pool::PassInputs;
use selection::SelectionInputs;

/// Package list and parameters of a batch run, as the start hook may rewrite them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchDexoptParams {
    pub packages: Vec<String>,
    pub params: DexoptParams,
}

/// Called once per batch run before any package is compiled.
///
/// The hook may replace `params.packages` and any field of `params.params` except the
/// reason. A split name it sets is ignored. An error aborts the run.
pub trait BatchDexoptStartHook: Send + Sync {
    fn on_batch_dexopt_start(
        &self,
        snapshot: &PackageSnapshot,
        reason: DexoptReason,
        default_packages: &[String],
        params: &mut BatchDexoptParams,
        cancel: &CancellationSignal,
    ) -> Result<()>;
}

impl<F> BatchDexoptStartHook for F
where
    F: Fn(
            &PackageSnapshot,
            DexoptReason,
            &[String],
            &mut BatchDexoptParams,
            &CancellationSignal,
        ) -> Result<()>
        + Send
        + Sync,
{
    fn on_batch_dexopt_start(
        &self,
        snapshot: &PackageSnapshot,
        reason: DexoptReason,
        default_packages: &[String],
        params: &mut BatchDexoptParams,
        cancel: &CancellationSignal,
    ) -> Result<()> {
        self(snapshot, reason, default_packages, params, cancel)
    }
}

pub struct BatchDexopter {
    config: BatchConfig,
    compiler: Arc<dyn CompilerDriver>,
    storage: Arc<dyn StorageProbe>,
    clock: Arc<dyn Clock>,
    dex_use: Arc<DexUseStore>,
}

impl BatchDexopter {
    pub fn new(config: BatchConfig, effects: &Effects, dex_use: Arc<DexUseStore>) -> Self {
        Self {
            config,
            compiler: Arc::clone(&effects.compiler),
            storage: Arc::clone(&effects.storage),
            clock: Arc::clone(&effects.clock),
            dex_use,
        }
    }

    /// Packages `reason` selects before any hook runs.
    pub fn default_packages(
        &self,
        snapshot: &PackageSnapshot,
        reason: DexoptReason,
    ) -> Vec<String> {
        let inputs = SelectionInputs {
            snapshot,
            dex_use: &self.dex_use,
            now_ms: self.clock.now_ms(),
            inactive_window: self.config.inactive_window,
        };
        selection::select(reason.policy().selection, &inputs)
    }

    /// Default packages and parameters for `reason`, after the start hook had its say.
    pub fn batch_dexopt_params(
        &self,
        snapshot: &PackageSnapshot,
        reason: DexoptReason,
        cancel: &CancellationSignal,
        hook: Option<&dyn BatchDexoptStartHook>,
    ) -> Result<BatchDexoptParams> {
        let default_packages = self.default_packages(snapshot, reason);
        let mut params = DexoptParams::for_reason(reason);
        if reason.is_boot_after_update() {
            if let Some(launcher) = snapshot.launcher_package() {
                params
                    .package_filter_overrides
                    .insert(launcher.to_string(), CompilerFilter::SpeedProfile);
            }
            if let Some(system_ui) = snapshot.system_ui_package() {
                params
                    .package_filter_overrides
                    .insert(system_ui.to_string(), CompilerFilter::Speed);
            }
        }

        let mut batch = BatchDexoptParams {
            packages: default_packages.clone(),
            params,
        };
        let Some(hook) = hook else {
            return Ok(batch);
        };
        hook.on_batch_dexopt_start(snapshot, reason, &default_packages, &mut batch, cancel)?;
        if batch.params.reason != reason {
            return Err(DexoptError::illegal(format!(
                "batch dexopt start hook changed the reason from '{reason}' to '{}'",
                batch.params.reason
            )));
        }
        if let Some(split) = batch.params.split_name.take() {
            warn!(
                reason = %reason,
                split = %split,
                "ignoring split name set by batch dexopt start hook"
            );
        }
        Ok(batch)
    }

    /// Runs every pass `reason` calls for. Passes that had nothing to do are absent.
    pub fn dexopt_packages(
        &self,
        snapshot: &PackageSnapshot,
        reason: DexoptReason,
        cancel: &CancellationSignal,
        hook: Option<&dyn BatchDexoptStartHook>,
    ) -> Result<BTreeMap<BatchPass, DexoptResult>> {
        let BatchDexoptParams { packages, params } =
            self.batch_dexopt_params(snapshot, reason, cancel, hook)?;
        let policy = reason.policy();
        let mut results = BTreeMap::new();

        if policy.downgrade_eligible && self.storage_is_low() {
            let kept: BTreeSet<&str> = packages.iter().map(String::as_str).collect();
            let downgrade: Vec<String> = self
                .default_packages(snapshot, DexoptReason::Inactive)
                .into_iter()
                .filter(|name| !kept.contains(name.as_str()))
                .collect();
            if !downgrade.is_empty() {
                let downgrade_params = DexoptParams::for_reason(DexoptReason::Inactive);
                let result = self.run_pass(
                    BatchPass::Downgrade,
                    snapshot,
                    &downgrade,
                    &downgrade_params,
                    cancel,
                );
                results.insert(BatchPass::Downgrade, result);
            }
        }

        let main = self.run_pass(BatchPass::Main, snapshot, &packages, &params, cancel);
        let supplementary: Vec<String> =
            if policy.supplementary_eligible && !params.force_merge_profile {
                main.packages
                    .iter()
                    .filter(|pkg| pkg.skipped_with_profile())
                    .map(|pkg| pkg.package_name.clone())
                    .collect()
            } else {
                Vec::new()
            };
        results.insert(BatchPass::Main, main);

        if !supplementary.is_empty() {
            let forced = params.with_force_merge_profile();
            let result = self.run_pass(
                BatchPass::Supplementary,
                snapshot,
                &supplementary,
                &forced,
                cancel,
            );
            results.insert(BatchPass::Supplementary, result);
        }
        Ok(results)
    }

    fn storage_is_low(&self) -> bool {
        match self.storage.allocatable_bytes() {
            Ok(bytes) => {
                let low = bytes < self.config.downgrade_threshold_bytes;
                debug!(
                    allocatable_bytes = bytes,
                    threshold = self.config.downgrade_threshold_bytes,
                    low,
                    "checked storage"
                );
                low
            }
            Err(err) => {
                warn!("failed to query allocatable storage, assuming it is not low: {err:#}");
                false
            }
        }
    }

    fn run_pass(
        &self,
        pass: BatchPass,
        snapshot: &PackageSnapshot,
        packages: &[String],
        params: &DexoptParams,
        cancel: &CancellationSignal,
    ) -> DexoptResult {
        let stopwatch = Stopwatch::start(Timed::Pass(pass));
        info!(
            pass = %pass,
            reason = %params.reason,
            packages = packages.len(),
            "starting batch dexopt pass"
        );
        let inputs = PassInputs {
            compiler: self.compiler.as_ref(),
            snapshot,
            params,
            cancel,
            concurrency: self.config.concurrency,
        };
        let results = pool::dexopt_all(&inputs, packages);
        stopwatch.finish(cancel.is_cancelled());
        DexoptResult {
            reason: params.reason,
            requested_compiler_filter: params.compiler_filter,
            packages: results,
        }
    }
}
