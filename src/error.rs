use crate::cancel::Phase;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HaloError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Degenerate geometry: {0}")]
    DegenerateGeometry(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Spatial index has not been built")]
    NotInitialized,
    #[error("Halo finding cancelled after {0}")]
    Cancelled(Phase),
}

pub type Result<T> = std::result::Result<T, HaloError>;
