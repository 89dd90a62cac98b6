use thiserror::Error;

/// Failure kinds for the generation lifecycle. Validation and configuration
/// problems are distinguishable from pipeline failures so callers can map
/// them to different responses; persistence errors exist as a kind but are
/// never returned from `generate` (they are logged and swallowed).
#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("empty prompt provided")]
    EmptyPrompt,

    #[error("invalid request: {0}")]
    Validation(&'static str),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("generation failed: {0}")]
    Generation(#[source] anyhow::Error),

    #[error("could not persist image: {0}")]
    Persistence(#[source] anyhow::Error),
}

impl GenerateError {
    /// True for errors the caller can fix by changing the request.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::EmptyPrompt | Self::Validation(_))
    }
}
