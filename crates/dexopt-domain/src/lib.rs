#![deny(clippy::all, warnings)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

pub mod dexopt;
pub mod loader;
pub mod ota;
pub mod package;

pub use dexopt::{
    BatchPass, CompilerFilter, DexFileDexoptResult, DexoptParams, DexoptReason, DexoptResult,
    DexoptStatus, PackageDexoptResult, PackageSelection, PreRebootResult, PriorityClass,
    ReasonPolicy,
};
pub use loader::{
    is_loader_other_app, is_used_by_other_apps, CheckedSecondaryDexInfo, ClassLoaderContext,
    DexLoader, FileVisibility, SecondaryDexInfo, UNSUPPORTED_CLASS_LOADER_CONTEXT,
    VARYING_CLASS_LOADER_CONTEXTS,
};
pub use ota::{OtaSlot, ParseOtaSlotError};
pub use package::{CallerInfo, PackageSnapshot, PackageState, SplitInfo, Uid, PLATFORM_PACKAGE_NAME};
