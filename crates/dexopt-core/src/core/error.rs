use crate::core::tooling::diagnostics;

/// Contract violations reported straight to the caller.
///
/// Collaborator faults are not represented here; they travel as `anyhow::Error`.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DexoptError {
    #[error("[DX100] invalid argument: {0}")]
    InvalidArgument(String),
    #[error("[DX200] illegal state: {0}")]
    IllegalState(String),
}

impl DexoptError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => diagnostics::contract::INVALID_ARGUMENT,
            Self::IllegalState(_) => diagnostics::contract::ILLEGAL_STATE,
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> anyhow::Error {
        Self::InvalidArgument(message.into()).into()
    }

    pub(crate) fn illegal(message: impl Into<String>) -> anyhow::Error {
        Self::IllegalState(message.into()).into()
    }
}
