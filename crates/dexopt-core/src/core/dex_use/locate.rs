use dexopt_domain::package::path_starts_with;
use dexopt_domain::{PackageSnapshot, PackageState};

use crate::core::error::DexoptError;

/// Rejects paths that are not absolute, normalized, and bounded.
pub(crate) fn validate_dex_path(path: &str, max_len: usize) -> Result<(), DexoptError> {
    let problem = if path.is_empty() {
        Some("is empty")
    } else if path.len() > max_len {
        Some("is too long")
    } else if !path.starts_with('/') {
        Some("is not absolute")
    } else if path.contains("//") {
        Some("contains '//'")
    } else if path.contains("/./") || path.ends_with("/.") {
        Some("contains '/./'")
    } else if path.contains("/../") || path.ends_with("/..") {
        Some("contains '/../'")
    } else if path.ends_with('/') {
        Some("ends with '/'")
    } else {
        None
    };
    match problem {
        Some(problem) => Err(DexoptError::InvalidArgument(format!(
            "dex path '{}' {problem}",
            truncate(path)
        ))),
        None => Ok(()),
    }
}

pub(crate) fn validate_class_loader_context(
    dex_path: &str,
    context: &str,
    max_len: usize,
) -> Result<(), DexoptError> {
    if context.is_empty() {
        return Err(DexoptError::InvalidArgument(format!(
            "class loader context for '{}' is empty",
            truncate(dex_path)
        )));
    }
    if context.len() > max_len {
        return Err(DexoptError::InvalidArgument(format!(
            "class loader context for '{}' is too long ({} > {max_len})",
            truncate(dex_path),
            context.len()
        )));
    }
    Ok(())
}

fn truncate(path: &str) -> &str {
    const SHOWN: usize = 128;
    match path.char_indices().nth(SHOWN) {
        Some((idx, _)) => &path[..idx],
        None => path,
    }
}

/// Where a reported dex path belongs.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DexOwner<'a> {
    Primary(&'a PackageState),
    Secondary(&'a PackageState),
    /// Inside a package's code directory but not one of its splits.
    DontRecord,
    Unknown,
}

/// Finds the owner of `dex_path`, checking the loading package before every other package.
pub(crate) fn resolve_owner<'a>(
    snapshot: &'a PackageSnapshot,
    loading: &'a PackageState,
    dex_path: &str,
    user_id: u32,
) -> DexOwner<'a> {
    let others = snapshot
        .packages()
        .filter(|pkg| pkg.name != loading.name);
    for pkg in std::iter::once(loading).chain(others) {
        if let Some(owner) = classify(pkg, dex_path, user_id) {
            return owner;
        }
    }
    DexOwner::Unknown
}

fn classify<'a>(pkg: &'a PackageState, dex_path: &str, user_id: u32) -> Option<DexOwner<'a>> {
    if pkg.is_split_path(dex_path) {
        return Some(DexOwner::Primary(pkg));
    }
    if pkg
        .data_dirs(user_id)
        .iter()
        .any(|dir| path_starts_with(dex_path, dir))
    {
        return Some(DexOwner::Secondary(pkg));
    }
    match pkg.code_dir() {
        Some(code_dir) if path_starts_with(dex_path, code_dir) => Some(DexOwner::DontRecord),
        _ => None,
    }
}
