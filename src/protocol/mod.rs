//! Wire format spoken to browser clients

pub mod handshake;

pub use handshake::{encode_header, HEADER_SIZE, REJECT_NOTICE, SHUTDOWN_NOTICE, STREAM_MAGIC};
