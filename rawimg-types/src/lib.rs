#![doc = include_str!("../README.md")]
#![allow(clippy::multiple_crate_versions)]

extern crate alloc;

use alloc::fmt;
use std::{env::consts, io};

use serde::Deserialize;

/// Representation of an hardware architecture
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, clap::ValueEnum)]
#[clap(rename_all = "lower")]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    /// ARM's AARCH32 Architecture
    Arm,

    /// ARM's AARCH64 Architecture
    Arm64,

    /// Intel's x86 Architecture
    #[clap(name = "i686")]
    #[serde(rename = "i686")]
    X86,

    /// Intel's X86-64 Architecture
    #[clap(name = "x86_64")]
    #[serde(rename = "x86_64")]
    X86_64,
}

impl Architecture {
    /// Creates our architecture enum from the Rust architecture name
    ///
    /// # Errors
    ///
    /// If the given architecture is unknown
    pub fn from_rust_str(s: &str) -> Result<Self, ImagerError> {
        Ok(match s {
            "aarch64" => Self::Arm64,
            "arm" => Self::Arm,
            "x86_64" => Self::X86_64,
            "x86" => Self::X86,
            _ => {
                return Err(ImagerError::Config(format!(
                    "Unknown architecture: {s}"
                )))
            }
        })
    }

    /// Returns the architecture name as used by distributions
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Arm => "arm",
            Self::Arm64 => "aarch64",
            Self::X86 => "i686",
            Self::X86_64 => "x86_64",
        }
    }

    /// Returns true for any ARM flavour
    #[must_use]
    pub fn is_arm(self) -> bool {
        matches!(self, Self::Arm | Self::Arm64)
    }

    /// Architecture we are running on
    ///
    /// # Errors
    ///
    /// If the host architecture isn't supported
    pub fn host() -> Result<Self, ImagerError> {
        Self::from_rust_str(consts::ARCH)
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compression applied to each finished disk file
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, clap::ValueEnum)]
pub enum CompressionAlgorithm {
    /// gzip, through flate2
    #[clap(name = "gz")]
    #[serde(rename = "gz")]
    Gzip,

    /// Zstandard
    #[clap(name = "zst")]
    #[serde(rename = "zst")]
    Zstd,
}

impl CompressionAlgorithm {
    /// File name extension appended to compressed files
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Gzip => "gz",
            Self::Zstd => "zst",
        }
    }
}

/// Hash algorithms used for the image checksums
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DigestAlgorithm {
    /// SHA-256
    Sha256,

    /// SHA-512
    Sha512,
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        })
    }
}

/// Our Error Type
#[derive(thiserror::Error, Debug)]
pub enum ImagerError {
    /// The image description or the build configuration is malformed or incomplete
    #[error("Configuration Error: {0}")]
    Config(String),

    /// A loop device, mount, boot record or bootloader operation failed
    #[error("Mount Error: {0}")]
    Mount(String),

    /// An external collaborator failed while building the image
    #[error("Build Error: {0}")]
    Build(String),

    /// An error has occurred when accessing the local filesystem or files
    #[error("I/O Error")]
    Io(#[from] io::Error),

    /// An error has occurred when parsing JSON data
    #[error("JSON Parsing Failure")]
    Json(#[from] serde_json::Error),
}
