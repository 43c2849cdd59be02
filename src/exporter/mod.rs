//! Exporter egress
//!
//! External exporters pull committed records of a partition through an
//! [`ExporterFeed`] and acknowledge what they consumed. The leader persists
//! acknowledged positions by appending `EXPORTER:UPDATE_POSITION` commands,
//! so every replica knows how far each exporter got and never compacts
//! records an exporter still needs.

mod director;

pub use self::director::{ExporterDirector, ExporterDirectorConfig, ExporterFeed, ExporterMessage};

use crate::actor::ActorError;
use crate::logstream::LogStreamError;
use crate::state::StateError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExporterError {
    #[error("unknown exporter {0:?}")]
    UnknownExporter(String),

    #[error("position {position} is beyond the commit position {commit_position}")]
    BeyondCommit { position: i64, commit_position: i64 },

    #[error(transparent)]
    Log(#[from] LogStreamError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("exporter director is closed")]
    Closed,
}

impl From<ActorError> for ExporterError {
    fn from(_: ActorError) -> Self {
        ExporterError::Closed
    }
}
