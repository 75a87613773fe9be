//! Error types for read and write operations.
use std::path::PathBuf;

use thiserror::Error;
use zune_inflate::errors::InflateDecodeErrors;

#[derive(Debug, Error)]
#[error("error reading {path:?}")]
pub struct ReadFileError {
    pub path: PathBuf,
    #[source]
    pub source: binrw::Error,
}

#[derive(Debug, Error)]
pub enum DecompressArrayError {
    #[error("error decoding compressed array payload")]
    ZLib(#[from] InflateDecodeErrors),
}
