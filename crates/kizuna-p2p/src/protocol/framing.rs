//! Line framing: one JSON object per newline-terminated frame.
//!
//! The overlay's streams preserve bytes, not message boundaries, so frames
//! are newline-delimited with a hard per-frame ceiling.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::codec::LinesCodec;

/// Per-frame ceiling. A frame above this kills the session.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Codec for the receive side of a peer stream.
pub fn frame_codec() -> LinesCodec {
    LinesCodec::new_with_max_length(MAX_FRAME_BYTES)
}

/// Write one frame. `json` must not contain a newline.
pub async fn write_frame<W>(writer: &mut W, json: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}
