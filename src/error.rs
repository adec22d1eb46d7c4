use thiserror::Error;

use crate::definition::DefinitionError;
use crate::message::StoreError;
use crate::state::StateError;

/// Crate-level convenience error.
///
/// A thin wrapper over the canonical capability errors; each subsystem keeps
/// its own error type and callers that span subsystems use this one.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
