use std::cmp::Reverse;
use std::time::Duration;

use dexopt_domain::{PackageSelection, PackageSnapshot, PackageState};

use crate::core::dex_use::DexUseStore;

/// Activity facts for one candidate package.
struct Activity<'a> {
    name: &'a str,
    first_install_ms: u64,
    /// Most recent load of the package's own code. `None` if never loaded.
    last_used_ms: Option<u64>,
}

impl Activity<'_> {
    fn last_active_ms(&self) -> u64 {
        self.last_used_ms
            .map_or(self.first_install_ms, |used| used.max(self.first_install_ms))
    }
}

pub(crate) struct SelectionInputs<'a> {
    pub(crate) snapshot: &'a PackageSnapshot,
    pub(crate) dex_use: &'a DexUseStore,
    pub(crate) now_ms: u64,
    pub(crate) inactive_window: Option<Duration>,
}

impl SelectionInputs<'_> {
    fn threshold_ms(&self) -> Option<u64> {
        self.inactive_window.map(|window| {
            let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
            self.now_ms.saturating_sub(window_ms)
        })
    }

    fn activities(&self) -> Vec<Activity<'_>> {
        self.snapshot
            .packages()
            .filter(|pkg| pkg.can_dexopt())
            .map(|pkg| Activity {
                name: &pkg.name,
                first_install_ms: pkg.first_install_time_ms,
                last_used_ms: self.dex_use.package_last_used_at_ms(&pkg.name),
            })
            .collect()
    }
}

pub(crate) fn select(selection: PackageSelection, inputs: &SelectionInputs<'_>) -> Vec<String> {
    match selection {
        PackageSelection::AllUnsorted => inputs
            .snapshot
            .packages()
            .filter(|pkg| pkg.can_dexopt())
            .map(|pkg| pkg.name.clone())
            .collect(),
        PackageSelection::AllByLastUse => by_last_use(inputs),
        PackageSelection::SystemUiAndLauncher => system_ui_and_launcher(inputs.snapshot),
        PackageSelection::Inactive => inactive(inputs),
    }
}

/// Packages active within the window, never-used first, then most recent first.
///
/// A never-used package counts as active only while its install is recent.
fn by_last_use(inputs: &SelectionInputs<'_>) -> Vec<String> {
    let threshold = inputs.threshold_ms();
    let mut recent: Vec<Activity<'_>> = inputs
        .activities()
        .into_iter()
        .filter(|activity| {
            !threshold.is_some_and(|threshold| activity.last_active_ms() <= threshold)
        })
        .collect();
    recent.sort_by_key(|activity| {
        (
            activity.last_used_ms.is_some(),
            Reverse(activity.last_active_ms()),
            activity.name,
        )
    });
    recent
        .into_iter()
        .map(|activity| activity.name.to_string())
        .collect()
}

/// Packages installed and last used before the inactivity window, least recent first.
fn inactive(inputs: &SelectionInputs<'_>) -> Vec<String> {
    let Some(threshold) = inputs.threshold_ms() else {
        return Vec::new();
    };
    let mut stale: Vec<Activity<'_>> = inputs
        .activities()
        .into_iter()
        .filter(|activity| {
            activity.first_install_ms <= threshold
                && !activity.last_used_ms.is_some_and(|used| used > threshold)
        })
        .collect();
    stale.sort_by_key(|activity| (activity.last_active_ms(), activity.name));
    stale
        .into_iter()
        .map(|activity| activity.name.to_string())
        .collect()
}

fn system_ui_and_launcher(snapshot: &PackageSnapshot) -> Vec<String> {
    let mut selected: Vec<String> = Vec::new();
    let candidates = [snapshot.system_ui_package(), snapshot.launcher_package()];
    for name in candidates.into_iter().flatten() {
        let dexoptable = snapshot
            .package_state(name)
            .is_some_and(PackageState::can_dexopt);
        if dexoptable && !selected.iter().any(|existing| existing == name) {
            selected.push(name.to_string());
        }
    }
    selected
}
