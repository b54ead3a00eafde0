use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    AsRefStr,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum CompilerFilter {
    AssumeVerified,
    Extract,
    Verify,
    SpaceProfile,
    Space,
    SpeedProfile,
    Speed,
    EverythingProfile,
    Everything,
}

impl CompilerFilter {
    pub fn is_profile_guided(self) -> bool {
        matches!(
            self,
            Self::SpaceProfile | Self::SpeedProfile | Self::EverythingProfile
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, AsRefStr, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum PriorityClass {
    Boot,
    Interactive,
    Background,
}

/// Which installed packages a reason selects by default.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PackageSelection {
    /// Every dexoptable package, in inventory order.
    AllUnsorted,
    /// Every dexoptable package active within the inactivity window, most recent first.
    AllByLastUse,
    SystemUiAndLauncher,
    /// Dexoptable packages inactive for longer than the inactivity window, least recent first.
    Inactive,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReasonPolicy {
    pub filter: CompilerFilter,
    pub priority: PriorityClass,
    pub selection: PackageSelection,
    pub downgrade_eligible: bool,
    pub supplementary_eligible: bool,
}

/// Trigger of a batch dexopt run.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    AsRefStr,
    Display,
    EnumString,
    EnumIter,
)]
pub enum DexoptReason {
    #[strum(serialize = "first-boot")]
    #[serde(rename = "first-boot")]
    FirstBoot,
    #[strum(serialize = "boot-after-ota")]
    #[serde(rename = "boot-after-ota")]
    BootAfterOta,
    #[strum(serialize = "boot-after-mainline-update")]
    #[serde(rename = "boot-after-mainline-update")]
    BootAfterMainlineUpdate,
    #[strum(serialize = "bg-dexopt")]
    #[serde(rename = "bg-dexopt")]
    BgDexopt,
    #[strum(serialize = "ab-ota")]
    #[serde(rename = "ab-ota")]
    PreRebootDexopt,
    #[strum(serialize = "inactive")]
    #[serde(rename = "inactive")]
    Inactive,
}

impl DexoptReason {
    pub fn policy(self) -> ReasonPolicy {
        use CompilerFilter::{SpeedProfile, Verify};
        use PackageSelection::{AllByLastUse, AllUnsorted, Inactive, SystemUiAndLauncher};
        use PriorityClass::{Background, Boot};

        let (filter, priority, selection, downgrade, supplementary) = match self {
            Self::FirstBoot => (Verify, Boot, AllUnsorted, false, false),
            Self::BootAfterOta => (Verify, Boot, AllByLastUse, false, false),
            Self::BootAfterMainlineUpdate => (Verify, Boot, SystemUiAndLauncher, false, false),
            Self::BgDexopt => (SpeedProfile, Background, AllByLastUse, true, true),
            Self::PreRebootDexopt => (SpeedProfile, Background, AllByLastUse, false, false),
            Self::Inactive => (Verify, Background, Inactive, false, false),
        };
        ReasonPolicy {
            filter,
            priority,
            selection,
            downgrade_eligible: downgrade,
            supplementary_eligible: supplementary,
        }
    }

    /// Reasons that follow a system or Mainline update, where UI packages are compiled harder.
    pub fn is_boot_after_update(self) -> bool {
        matches!(self, Self::BootAfterOta | Self::BootAfterMainlineUpdate)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DexoptParams {
    pub reason: DexoptReason,
    pub compiler_filter: CompilerFilter,
    pub priority: PriorityClass,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub package_filter_overrides: BTreeMap<String, CompilerFilter>,
    #[serde(default)]
    pub force_merge_profile: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split_name: Option<String>,
}

impl DexoptParams {
    pub fn for_reason(reason: DexoptReason) -> Self {
        let policy = reason.policy();
        Self {
            reason,
            compiler_filter: policy.filter,
            priority: policy.priority,
            package_filter_overrides: BTreeMap::new(),
            force_merge_profile: false,
            split_name: None,
        }
    }

    pub fn filter_for(&self, package_name: &str) -> CompilerFilter {
        self.package_filter_overrides
            .get(package_name)
            .copied()
            .unwrap_or(self.compiler_filter)
    }

    #[must_use]
    pub fn with_force_merge_profile(mut self) -> Self {
        self.force_merge_profile = true;
        self
    }
}

/// Outcome of compiling one file or package.
///
/// Variants are ordered by severity; an aggregate reports the most severe member.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    AsRefStr,
    Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum DexoptStatus {
    Skipped,
    Performed,
    Failed,
    Cancelled,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DexFileDexoptResult {
    pub dex_path: String,
    pub abi: String,
    pub actual_compiler_filter: CompilerFilter,
    pub status: DexoptStatus,
    #[serde(default)]
    pub wall_time_ms: u64,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub size_before_bytes: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageDexoptResult {
    pub package_name: String,
    pub status: DexoptStatus,
    pub files: Vec<DexFileDexoptResult>,
}

impl PackageDexoptResult {
    pub fn from_files(package_name: impl Into<String>, files: Vec<DexFileDexoptResult>) -> Self {
        let status = files
            .iter()
            .map(|file| file.status)
            .max()
            .unwrap_or(DexoptStatus::Skipped);
        Self {
            package_name: package_name.into(),
            status,
            files,
        }
    }

    /// Result for a package that was never picked up because the run was cancelled.
    pub fn cancelled(package_name: impl Into<String>) -> Self {
        Self {
            package_name: package_name.into(),
            status: DexoptStatus::Cancelled,
            files: Vec::new(),
        }
    }

    /// Whether any file was skipped although a profile-guided filter applied to it.
    pub fn skipped_with_profile(&self) -> bool {
        self.files.iter().any(|file| {
            file.status == DexoptStatus::Skipped && file.actual_compiler_filter.is_profile_guided()
        })
    }
}

/// Aggregate result of one pass over a list of packages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DexoptResult {
    pub reason: DexoptReason,
    pub requested_compiler_filter: CompilerFilter,
    pub packages: Vec<PackageDexoptResult>,
}

impl DexoptResult {
    pub fn final_status(&self) -> DexoptStatus {
        self.packages
            .iter()
            .map(|pkg| pkg.status)
            .max()
            .unwrap_or(DexoptStatus::Skipped)
    }

    pub fn package(&self, name: &str) -> Option<&PackageDexoptResult> {
        self.packages.iter().find(|pkg| pkg.package_name == name)
    }

    pub fn package_names(&self) -> Vec<&str> {
        self.packages
            .iter()
            .map(|pkg| pkg.package_name.as_str())
            .collect()
    }
}

/// Pass identifier in a batch result. The downgrade pass runs first.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    AsRefStr,
    Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum BatchPass {
    Downgrade,
    Main,
    Supplementary,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreRebootResult {
    pub success: bool,
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use strum::IntoEnumIterator;

    use super::*;

    fn file(status: DexoptStatus, filter: CompilerFilter) -> DexFileDexoptResult {
        DexFileDexoptResult {
            dex_path: "/data/app/p/base.apk".into(),
            abi: "arm64-v8a".into(),
            actual_compiler_filter: filter,
            status,
            wall_time_ms: 0,
            size_bytes: 0,
            size_before_bytes: 0,
        }
    }

    #[test]
    fn reason_strings_round_trip() {
        for reason in DexoptReason::iter() {
            assert_eq!(DexoptReason::from_str(reason.as_ref()), Ok(reason));
        }
        assert_eq!(DexoptReason::PreRebootDexopt.to_string(), "ab-ota");
    }

    #[test]
    fn only_background_dexopt_downgrades() {
        let downgrading: Vec<_> = DexoptReason::iter()
            .filter(|reason| reason.policy().downgrade_eligible)
            .collect();
        assert_eq!(downgrading, vec![DexoptReason::BgDexopt]);
    }

    #[test]
    fn overrides_win_over_reason_filter() {
        let mut params = DexoptParams::for_reason(DexoptReason::BootAfterOta);
        params
            .package_filter_overrides
            .insert("ui".into(), CompilerFilter::Speed);
        assert_eq!(params.filter_for("ui"), CompilerFilter::Speed);
        assert_eq!(params.filter_for("other"), CompilerFilter::Verify);
    }

    #[test]
    fn package_status_is_most_severe_file_status() {
        let result = PackageDexoptResult::from_files(
            "p",
            vec![
                file(DexoptStatus::Performed, CompilerFilter::SpeedProfile),
                file(DexoptStatus::Failed, CompilerFilter::Verify),
            ],
        );
        assert_eq!(result.status, DexoptStatus::Failed);
        assert_eq!(
            PackageDexoptResult::from_files("q", Vec::new()).status,
            DexoptStatus::Skipped
        );
    }

    #[test]
    fn skipped_profile_guided_file_is_detected() {
        let skipped = PackageDexoptResult::from_files(
            "p",
            vec![file(DexoptStatus::Skipped, CompilerFilter::SpeedProfile)],
        );
        assert!(skipped.skipped_with_profile());
        let verify = PackageDexoptResult::from_files(
            "p",
            vec![file(DexoptStatus::Skipped, CompilerFilter::Verify)],
        );
        assert!(!verify.skipped_with_profile());
    }
}
