//! Client handshake
//!
//! Every accepted client first receives an 8-byte header describing the
//! stream, as a binary message:
//!
//! ```text
//! offset  size  field
//!      0     4  magic   "jsmp"
//!      4     2  width   u16 big-endian
//!      6     2  height  u16 big-endian
//! ```
//!
//! After that, transcoder output is relayed unframed, one binary message per
//! chunk. Clients that connect before the frame size is known get
//! [`REJECT_NOTICE`] as text and are disconnected.

use bytes::{BufMut, Bytes, BytesMut};

use crate::session::Dimensions;

/// Stream magic, must be 4 bytes
pub const STREAM_MAGIC: &[u8; 4] = b"jsmp";

/// Size of the handshake header
pub const HEADER_SIZE: usize = 8;

/// Sent instead of the header while the frame size is unknown
pub const REJECT_NOTICE: &str = "stream dimensions unknown, socket will be closed";

/// Sent to every client when the stream stops
pub const SHUTDOWN_NOTICE: &str = "socket will be closed";

/// Encode the handshake header for the given frame size
pub fn encode_header(dimensions: Dimensions) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE);
    buf.put_slice(STREAM_MAGIC);
    buf.put_u16(dimensions.width);
    buf.put_u16(dimensions.height);
    buf.freeze()
}
