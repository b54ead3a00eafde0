use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Encoding the runtime reports when a class loader in the chain is foreign.
pub const UNSUPPORTED_CLASS_LOADER_CONTEXT: &str = "=UnsupportedClassLoaderContext=";

/// Display-only encoding for a dex file loaded with conflicting contexts. Never persisted.
pub const VARYING_CLASS_LOADER_CONTEXTS: &str = "=VaryingClassLoaderContexts=";

/// An entity that loads a dex file.
///
/// Ordering is by package name, then by the isolation flag, so sets of loaders render
/// deterministically.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DexLoader {
    pub loading_package_name: String,
    pub isolated_process: bool,
}

impl DexLoader {
    pub fn new(loading_package_name: impl Into<String>, isolated_process: bool) -> Self {
        Self {
            loading_package_name: loading_package_name.into(),
            isolated_process,
        }
    }
}

impl fmt::Display for DexLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.isolated_process {
            write!(f, "{} (isolated)", self.loading_package_name)
        } else {
            f.write_str(&self.loading_package_name)
        }
    }
}

/// Returns whether `loader` runs under a different uid than the owning package.
///
/// An isolated process of the owner counts as "other": it is sandboxed and can only read
/// world-readable artifacts.
pub fn is_loader_other_app(loader: &DexLoader, owning_package_name: &str) -> bool {
    loader.loading_package_name != owning_package_name || loader.isolated_process
}

pub fn is_used_by_other_apps<'a>(
    loaders: impl IntoIterator<Item = &'a DexLoader>,
    owning_package_name: &str,
) -> bool {
    loaders
        .into_iter()
        .any(|loader| is_loader_other_app(loader, owning_package_name))
}

/// The class loader context recorded for a secondary dex file.
///
/// `Unsupported` and `Varying` are terminal: once a path degrades it never returns to `Known`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "kebab-case")]
pub enum ClassLoaderContext {
    Known(String),
    Unsupported,
    Varying,
}

impl ClassLoaderContext {
    /// Interprets a context string reported by a loading process.
    pub fn from_reported(reported: &str) -> Self {
        if reported == UNSUPPORTED_CLASS_LOADER_CONTEXT {
            Self::Unsupported
        } else {
            Self::Known(reported.to_string())
        }
    }

    /// Folds a newly observed context into the recorded one.
    #[must_use]
    pub fn merge(self, observed: Self) -> Self {
        match (self, observed) {
            (Self::Unsupported, _) | (_, Self::Unsupported) => Self::Unsupported,
            (Self::Varying, _) | (_, Self::Varying) => Self::Varying,
            (Self::Known(current), Self::Known(next)) => {
                if current == next {
                    Self::Known(current)
                } else {
                    Self::Varying
                }
            }
        }
    }

    /// The context usable for compilation, if any.
    pub fn as_known(&self) -> Option<&str> {
        match self {
            Self::Known(value) => Some(value),
            Self::Unsupported | Self::Varying => None,
        }
    }

    pub fn display(&self) -> &str {
        match self {
            Self::Known(value) => value,
            Self::Unsupported => UNSUPPORTED_CLASS_LOADER_CONTEXT,
            Self::Varying => VARYING_CLASS_LOADER_CONTEXTS,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileVisibility {
    NotFound,
    OwnerOnly,
    WorldReadable,
}

/// Unchecked view of a tracked secondary dex file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SecondaryDexInfo {
    pub dex_path: String,
    pub user_id: u32,
    pub class_loader_context: ClassLoaderContext,
    pub abi_names: BTreeSet<String>,
    pub loaders: BTreeSet<DexLoader>,
    pub is_used_by_other_apps: bool,
}

/// A secondary dex file re-validated against the file system.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CheckedSecondaryDexInfo {
    #[serde(flatten)]
    pub info: SecondaryDexInfo,
    pub file_visibility: FileVisibility,
}
