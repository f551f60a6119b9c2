use crate::ContextId;
use lockstep_core::SurfaceId;
use thiserror::Error;

/// Failures of the process-wide graphics backend itself.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("graphics backend failed to initialize: {0}")]
    Init(String),

    #[error("graphics backend unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum SurfaceError {
    /// The OS surface or its graphics context could not be created.
    #[error("failed to create surface '{title}': {reason}")]
    Creation { title: String, reason: String },

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("context {context} is current on another thread")]
    ContextBusy { context: ContextId },

    #[error("context {context} is not current on the calling thread")]
    NotCurrent { context: ContextId },

    #[error("surface {surface} failed to present: {reason}")]
    Present { surface: SurfaceId, reason: String },

    #[error("surface {surface} is closed")]
    Closed { surface: SurfaceId },

    #[error(transparent)]
    Overlay(#[from] OverlayError),

    #[error(transparent)]
    Input(#[from] InputError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OverlayError {
    #[error("overlay frame already begun")]
    AlreadyInFrame,

    #[error("overlay frame was not begun")]
    NotInFrame,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InputError {
    #[error("input route for {0} is already registered")]
    AlreadyRegistered(SurfaceId),
}
