use thiserror::Error;

#[derive(Debug, Error)]
pub enum DosewatchError {
    #[error("Configuration error: {0}")]
    Config(String),
}

impl DosewatchError {
    /// Short error code string sent to clients in error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            DosewatchError::Config(_) => "CONFIG_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, DosewatchError>;
