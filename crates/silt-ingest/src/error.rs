//! Ingest tier errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] silt_core::Error),

    #[error("no such token: {0}")]
    NoSuchToken(String),
}

impl Error {
    pub fn is_no_such_token(&self) -> bool {
        matches!(self, Error::NoSuchToken(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
