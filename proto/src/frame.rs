use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Upper bound on a single control-channel frame.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

const READ_CHUNK: usize = 4096;

/// Incremental reader for self-delimited JSON frames.
///
/// The wire carries bare JSON objects back to back, with no length prefix or
/// separator; a frame ends where the JSON value ends. Bytes are buffered and
/// complete values are pulled off the front, so frames split across reads and
/// multiple frames arriving in one read both work.
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
        }
    }

    /// Reads the next frame, or `None` on a clean end of stream.
    ///
    /// A stream that ends mid-value, or a value that does not parse as `T`,
    /// is a [`Error::Decode`]; a frame growing past [`MAX_FRAME_LEN`] is a
    /// [`Error::Protocol`].
    pub async fn read_frame<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        loop {
            if let Some(value) = self.try_decode()? {
                return Ok(Some(value));
            }

            if self.buf.len() > MAX_FRAME_LEN {
                return Err(Error::Protocol(format!(
                    "frame exceeds {MAX_FRAME_LEN} bytes"
                )));
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                if self.has_pending() {
                    return Err(Error::Decode("stream ended mid-frame".to_string()));
                }
                return Ok(None);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn try_decode<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        if self.buf.is_empty() {
            return Ok(None);
        }

        let decoded = {
            let mut stream = serde_json::Deserializer::from_slice(&self.buf).into_iter::<T>();
            match stream.next() {
                Some(Ok(value)) => Some((value, stream.byte_offset())),
                // End-of-input mid-value just means we need more bytes.
                Some(Err(e)) if e.is_eof() => None,
                Some(Err(e)) => return Err(Error::Decode(e.to_string())),
                None => None,
            }
        };

        match decoded {
            Some((value, consumed)) => {
                self.buf.drain(..consumed);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// True when buffered bytes beyond whitespace are waiting to be decoded.
    pub fn has_pending(&self) -> bool {
        self.buf.iter().any(|b| !b.is_ascii_whitespace())
    }

    /// Hands back the underlying stream and any undecoded residue.
    pub fn into_inner(self) -> (R, Vec<u8>) {
        (self.inner, self.buf)
    }
}

/// Encodes one value as a JSON frame and writes it out.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(value).map_err(|e| Error::Decode(e.to_string()))?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}
