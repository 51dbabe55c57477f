use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("failed to resolve required path: {0}")]
    Path(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Config(String),
    #[error("input file rejected: {0}")]
    Input(String),
    #[error("geocoder rejected request: {0}")]
    Geocoder(String),
}

/// Whether a failure should stop a whole run or only the address at hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Fatal,
    Recoverable,
}

impl AppError {
    pub fn class(&self) -> FailureClass {
        match self {
            AppError::Path(_) | AppError::Config(_) | AppError::Input(_) | AppError::Csv(_) => {
                FailureClass::Fatal
            }
            AppError::Io(_) | AppError::Json(_) | AppError::Http(_) | AppError::Geocoder(_) => {
                FailureClass::Recoverable
            }
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.class() == FailureClass::Fatal
    }
}
