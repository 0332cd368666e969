//! Store tier errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] silt_core::Error),

    #[error("no peers available")]
    NoPeersAvailable,

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("ingest peer sent no claim token")]
    MissingToken,
}

impl Error {
    pub fn is_malformed(&self) -> bool {
        matches!(self, Error::Core(silt_core::Error::MalformedRecord(_)))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
