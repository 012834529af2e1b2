use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VsocError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Region not found: {0}")]
    RegionNotFound(String),

    #[error("Incompatible layout version {major}.{minor}, expected major {expected}")]
    IncompatibleVersion { major: u16, minor: u16, expected: u16 },

    #[error("Invalid layout: {0}")]
    InvalidLayout(String),

    #[error("Buffer size mismatch: need {needed} bytes, have {available}")]
    SizeMismatch { needed: usize, available: usize },

    #[error("Invalid packet: {0}")]
    InvalidPacket(String),
}
