//! Descriptor-backed byte streams and line splitting.
//!
//! This crate is the process-agnostic half of `procpipe`: it turns one raw
//! OS descriptor into a single-consumer, backpressured stream of byte
//! chunks ([`FdStream`]), and re-chunks any such stream into logical lines
//! ([`LineChunks`]). Nothing in here knows about child processes; the same
//! types work for a pipe handed over by an executor, a socket, or a plain
//! file.

pub mod error;
pub mod lines;
#[cfg(unix)]
pub mod stream;

pub use error::FdStreamError;
pub use lines::LineChunks;
#[cfg(unix)]
pub use stream::FdStream;
