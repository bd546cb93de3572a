//! Error types for Lanferry.
//!
//! This module provides a unified error type for all Lanferry operations,
//! with one variant per failure kind the protocol distinguishes.

use std::io;

use thiserror::Error;

/// A specialized `Result` type for Lanferry operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for Lanferry.
#[derive(Error, Debug)]
pub enum Error {
    /// Socket or file I/O fault; the transport is not locally recoverable
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Unexpected message type or malformed payload
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Declared frame payload exceeds the block size
    #[error("frame payload of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge {
        /// Declared payload size from the frame header
        size: u32,
        /// Maximum accepted payload size
        max: usize,
    },

    /// The receiver rejected our password
    #[error("password rejected by peer")]
    InvalidPassword,

    /// The peer ended the exchange at a non-terminal step
    #[error("transfer cancelled by peer")]
    RemoteCancelled,

    /// The local user aborted via a prompt
    #[error("transfer cancelled by user")]
    LocalCancelled,

    /// A cancellation token fired
    #[error("operation cancelled")]
    Cancelled,

    /// The file cannot be opened, sized, or accessed
    #[error("file unavailable: {0}")]
    FileUnavailable(String),

    /// Operation attempted on a closed component
    #[error("component already disposed")]
    Disposed,
}

impl Error {
    /// Returns whether this error should be surfaced to the user.
    ///
    /// `Disposed`, `Protocol`, and `FrameTooLarge` indicate a programming
    /// or peer implementation fault; everything else is reportable as a
    /// plain message.
    #[must_use]
    pub const fn is_user_visible(&self) -> bool {
        !matches!(
            self,
            Self::Disposed | Self::Protocol(_) | Self::FrameTooLarge { .. }
        )
    }

    /// Returns whether this error ends a transfer without marking it failed.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::LocalCancelled | Self::RemoteCancelled
        )
    }
}
