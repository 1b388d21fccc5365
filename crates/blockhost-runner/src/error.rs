use uuid::Uuid;

/// Conditions the runner reports as errors rather than as `false`/`None`.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("{what} {id} already exists")]
    AlreadyExists { what: &'static str, id: Uuid },
    #[error("{what} {id} not found")]
    NotFound { what: &'static str, id: Uuid },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl RunnerError {
    pub fn already_exists(what: &'static str, id: Uuid) -> Self {
        RunnerError::AlreadyExists { what, id }
    }

    pub fn not_found(what: &'static str, id: Uuid) -> Self {
        RunnerError::NotFound { what, id }
    }
}
