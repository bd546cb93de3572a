//! # Lanferry Core Library
//!
//! `lanferry-core` provides the core functionality for Lanferry, a
//! local network file transfer tool with resumable transfers.
//!
//! ## Features
//!
//! - **Zero-config discovery**: Peers announce themselves by periodic
//!   UDP broadcast on every usable interface
//! - **Resumable transfers**: Interrupted transfers continue from the
//!   last durably written block, across restarts
//! - **Concurrent transfers**: Each file travels on its own TCP stream
//!   under a per-peer session
//! - **Cross-platform**: Works on Windows, Linux, and macOS
//!
//! ## Modules
//!
//! - [`blockfile`] - Block-level file I/O and the resume sidecar
//! - [`discovery`] - Peer discovery via UDP broadcast
//! - [`exchange`] - Per-transfer parameter negotiation
//! - [`net`] - TCP acceptor and dialer
//! - [`node`] - Top-level node tying everything together
//! - [`protocol`] - Wire framing and payload codecs
//! - [`session`] - Per-peer session holding live transfers
//! - [`task`] - Restartable loop tasks with cooperative cancellation
//! - [`transfer`] - The block streaming engine
//! - [`ui`] - Interfaces implemented by the embedding front end
//!
//! ## Example
//!
//! ```rust,ignore
//! use lanferry_core::node::{Node, NodeOptions};
//!
//! let node = Node::bind(NodeOptions::new("/home/me/Downloads")).await?;
//! node.start()?;
//!
//! // On another device, push a file to this one
//! let session = node.connect("192.168.1.7".parse()?).await?;
//! session.start_outgoing("video.mkv".as_ref()).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]

pub mod blockfile;
pub mod discovery;
pub mod error;
pub mod exchange;
pub mod net;
pub mod node;
pub mod protocol;
pub mod session;
pub mod task;
pub mod transfer;
pub mod ui;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Size of one data block, in bytes. Also the maximum frame payload.
pub const BLOCK_SIZE: usize = 65_536;

/// Send and receive buffer size applied to every transfer socket.
pub const SOCKET_BUFFER: usize = 131_072;

/// TCP port the connection acceptor listens on.
pub const TRANSFER_PORT: u16 = 52_123;

/// UDP port used for discovery broadcasts.
pub const BROADCAST_PORT: u16 = 52_913;

/// Interval between discovery broadcasts.
pub const BROADCAST_INTERVAL: std::time::Duration = std::time::Duration::from_secs(2);

/// Name of the per-root directory holding resume sidecars.
pub const METADATA_DIR: &str = ".transfers_in_progress";
