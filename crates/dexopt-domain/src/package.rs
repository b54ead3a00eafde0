use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Package name of the platform itself. Loads reported under it are never recorded.
pub const PLATFORM_PACKAGE_NAME: &str = "android";

const PER_USER_RANGE: u32 = 100_000;
const FIRST_ISOLATED_UID: u32 = 99_000;
const LAST_ISOLATED_UID: u32 = 99_999;
const FIRST_APP_ZYGOTE_ISOLATED_UID: u32 = 90_000;
const LAST_APP_ZYGOTE_ISOLATED_UID: u32 = 98_999;

/// A kernel uid, encoding both the human user and the app id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Uid(pub u32);

impl Uid {
    pub fn user_id(self) -> u32 {
        self.0 / PER_USER_RANGE
    }

    pub fn app_id(self) -> u32 {
        self.0 % PER_USER_RANGE
    }

    pub fn is_isolated(self) -> bool {
        let app_id = self.app_id();
        (FIRST_ISOLATED_UID..=LAST_ISOLATED_UID).contains(&app_id)
            || (FIRST_APP_ZYGOTE_ISOLATED_UID..=LAST_APP_ZYGOTE_ISOLATED_UID).contains(&app_id)
    }
}

/// Identity of whoever reported a load.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallerInfo {
    pub uid: Uid,
}

impl CallerInfo {
    pub fn new(uid: u32) -> Self {
        Self { uid: Uid(uid) }
    }

    pub fn user_id(&self) -> u32 {
        self.uid.user_id()
    }

    pub fn is_isolated(&self) -> bool {
        self.uid.is_isolated()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitInfo {
    /// `None` for the base APK.
    #[serde(default)]
    pub name: Option<String>,
    pub path: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageState {
    pub name: String,
    /// Base APK first, then splits.
    #[serde(default)]
    pub splits: Vec<SplitInfo>,
    #[serde(default)]
    pub primary_abi: Option<String>,
    /// Adopted-storage volume, `None` for internal storage.
    #[serde(default)]
    pub storage_uuid: Option<String>,
    /// Latest first-install time across users.
    #[serde(default)]
    pub first_install_time_ms: u64,
    #[serde(default = "default_true")]
    pub dexoptable: bool,
    #[serde(default)]
    pub hibernating: bool,
}

fn default_true() -> bool {
    true
}

impl PackageState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            splits: Vec::new(),
            primary_abi: None,
            storage_uuid: None,
            first_install_time_ms: 0,
            dexoptable: true,
            hibernating: false,
        }
    }

    #[must_use]
    pub fn with_base_apk(mut self, path: impl Into<String>) -> Self {
        self.splits.insert(
            0,
            SplitInfo {
                name: None,
                path: path.into(),
            },
        );
        self
    }

    #[must_use]
    pub fn with_split(mut self, name: impl Into<String>, path: impl Into<String>) -> Self {
        self.splits.push(SplitInfo {
            name: Some(name.into()),
            path: path.into(),
        });
        self
    }

    pub fn is_split_path(&self, dex_path: &str) -> bool {
        self.splits.iter().any(|split| split.path == dex_path)
    }

    /// Directory holding the installed APKs, with a trailing slash.
    pub fn code_dir(&self) -> Option<&str> {
        let base = self.splits.first()?;
        let pos = base.path.rfind('/')?;
        Some(&base.path[..=pos])
    }

    /// Credential-encrypted and device-encrypted data directories for `user_id`.
    pub fn data_dirs(&self, user_id: u32) -> [String; 2] {
        let root = match &self.storage_uuid {
            Some(uuid) => format!("/mnt/expand/{uuid}"),
            None => "/data".to_string(),
        };
        [
            format!("{root}/user/{user_id}/{}", self.name),
            format!("{root}/user_de/{user_id}/{}", self.name),
        ]
    }

    pub fn can_dexopt(&self) -> bool {
        self.dexoptable && !self.hibernating
    }
}

/// Returns whether `path` is `prefix` or lies below it.
pub fn path_starts_with(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Point-in-time view of installed packages.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PackageSnapshot {
    packages: BTreeMap<String, PackageState>,
    system_ui: Option<String>,
    launcher: Option<String>,
}

#[derive(Deserialize)]
struct InventoryFile {
    #[serde(default)]
    packages: Vec<PackageState>,
    #[serde(default)]
    system_ui: Option<String>,
    #[serde(default)]
    launcher: Option<String>,
}

impl PackageSnapshot {
    pub fn new(packages: impl IntoIterator<Item = PackageState>) -> Self {
        Self {
            packages: packages
                .into_iter()
                .map(|pkg| (pkg.name.clone(), pkg))
                .collect(),
            system_ui: None,
            launcher: None,
        }
    }

    /// Parses an inventory document of the form
    /// `{"packages": [...], "system_ui": "...", "launcher": "..."}`.
    pub fn from_json(raw: &str) -> Result<Self> {
        let file: InventoryFile =
            serde_json::from_str(raw).context("failed to parse package inventory")?;
        let mut snapshot = Self::new(file.packages);
        snapshot.system_ui = file.system_ui;
        snapshot.launcher = file.launcher;
        Ok(snapshot)
    }

    #[must_use]
    pub fn with_system_ui(mut self, name: impl Into<String>) -> Self {
        self.system_ui = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_launcher(mut self, name: impl Into<String>) -> Self {
        self.launcher = Some(name.into());
        self
    }

    pub fn package_state(&self, name: &str) -> Option<&PackageState> {
        self.packages.get(name)
    }

    pub fn package_names(&self) -> BTreeSet<String> {
        self.packages.keys().cloned().collect()
    }

    pub fn packages(&self) -> impl Iterator<Item = &PackageState> {
        self.packages.values()
    }

    pub fn system_ui_package(&self) -> Option<&str> {
        self.system_ui.as_deref()
    }

    pub fn launcher_package(&self) -> Option<&str> {
        self.launcher.as_deref()
    }

    pub fn is_system_ui_or_launcher(&self, name: &str) -> bool {
        self.system_ui_package() == Some(name) || self.launcher_package() == Some(name)
    }
}
