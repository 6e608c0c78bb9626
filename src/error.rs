use thiserror::Error;

/// Failures opening a motion source. Monitoring cannot start; manual alerts still work.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SensorError {
    #[error("motion sensor unavailable: {0}")]
    Unavailable(String),

    #[error("motion sensor requires permission: {0}")]
    PermissionRequired(String),
}

/// Failures of the voice-command classification path.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClassifyError {
    #[error("command is empty")]
    EmptyInput,

    #[error("command classifier failed: {0}")]
    Failed(String),
}

/// Failures of a single alert effector. Reported, never fatal to an episode.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EffectorError {
    #[error("location unavailable, message sent without a map link")]
    GeolocationDenied,

    #[error("{effector} failed: {message}")]
    Launch {
        effector: &'static str,
        message: String,
    },
}

impl EffectorError {
    pub fn launch(effector: &'static str, err: impl std::fmt::Display) -> Self {
        EffectorError::Launch {
            effector,
            message: err.to_string(),
        }
    }
}
