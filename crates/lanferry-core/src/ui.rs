//! Interfaces implemented by the embedding front end.
//!
//! The core calls outward through these seams only; everything else
//! (dialog rendering, folder bookmarks, progress formatting) lives with
//! the embedder. Implementations must be cheap enough to call from
//! async context, or marshal to their own UI thread internally.

use std::path::PathBuf;

/// Outcome of a file name conflict prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictChoice {
    /// Delete the existing file and reuse its name
    Overwrite,
    /// Pick a fresh `name (n).ext` style name
    Rename,
    /// Abort the transfer
    Abort,
}

/// User-facing prompts raised by the receive path.
pub trait UserPrompts: Send + Sync {
    /// Ask whether an offered file should be accepted.
    fn confirm_transfer(&self, file_name: &str, size: u64) -> bool;

    /// Ask how to handle an existing file with the offered name.
    fn resolve_conflict(&self, file_name: &str) -> ConflictChoice;

    /// Surface a user-visible error message.
    fn report_error(&self, message: &str);
}

/// File and folder selection, implemented by the platform shell.
pub trait FilePicker: Send + Sync {
    /// Pick files to send. `None` means the user cancelled.
    fn pick_send_files(&self) -> Option<Vec<PathBuf>>;

    /// Pick the folder received files land in. `None` means cancelled.
    fn pick_receive_dir(&self) -> Option<PathBuf>;
}

/// Prompt implementation that accepts every transfer and renames on
/// conflict. Suits headless receivers and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl UserPrompts for AcceptAll {
    fn confirm_transfer(&self, _file_name: &str, _size: u64) -> bool {
        true
    }

    fn resolve_conflict(&self, _file_name: &str) -> ConflictChoice {
        ConflictChoice::Rename
    }

    fn report_error(&self, message: &str) {
        tracing::error!("{message}");
    }
}
