//! IPC bridge between the supervisor and its worker processes.
//!
//! - **protocol**: frames exchanged over the worker's stdin/stdout
//! - **codec**: length-prefixed JSON framing for any AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
