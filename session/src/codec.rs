//! `Content-Length` framed JSON-RPC over the server's stdio.
//!
//! Each message is a block of `Name: value` header lines, a blank line, and
//! exactly `Content-Length` bytes of JSON.

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Default cap on a single frame body (8 MiB). Status payloads are small but
/// some servers send large `initialize` results.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Parse one header line. Returns the `Content-Length` value if this line
/// carries it, `None` for any other header.
fn parse_header_line(line: &str) -> Result<Option<usize>> {
    let Some((name, value)) = line.split_once(':') else {
        bail!("malformed header line: {line:?}");
    };
    if !name.trim().eq_ignore_ascii_case("Content-Length") {
        return Ok(None);
    }
    let len = value
        .trim()
        .parse()
        .with_context(|| format!("invalid Content-Length value {:?}", value.trim()))?;
    Ok(Some(len))
}

pub struct FrameReader<R> {
    reader: BufReader<R>,
    max_frame_bytes: usize,
    line: String,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_limit(reader, DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_limit(reader: R, max_frame_bytes: usize) -> Self {
        Self {
            reader: BufReader::new(reader),
            max_frame_bytes,
            line: String::new(),
        }
    }

    /// Read the next frame.
    ///
    /// `Ok(None)` means the stream ended cleanly between frames. EOF inside a
    /// header block or body is an error.
    pub async fn read_frame(&mut self) -> Result<Option<serde_json::Value>> {
        let Some(len) = self.read_header_block().await? else {
            return Ok(None);
        };
        if len > self.max_frame_bytes {
            bail!(
                "frame of {len} bytes exceeds limit of {} bytes",
                self.max_frame_bytes
            );
        }

        let mut body = vec![0u8; len];
        self.reader
            .read_exact(&mut body)
            .await
            .context("reading frame body")?;
        let value = serde_json::from_slice(&body).context("decoding frame body as JSON")?;
        Ok(Some(value))
    }

    async fn read_header_block(&mut self) -> Result<Option<usize>> {
        let mut content_length = None;
        let mut started = false;

        loop {
            self.line.clear();
            let n = self
                .reader
                .read_line(&mut self.line)
                .await
                .context("reading header line")?;
            if n == 0 {
                if started {
                    bail!("stream ended inside a header block");
                }
                return Ok(None);
            }
            started = true;

            let line = self.line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                break;
            }
            if let Some(len) = parse_header_line(line)? {
                content_length = Some(len);
            }
        }

        content_length
            .map(Some)
            .context("header block without Content-Length")
    }
}

pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write one frame and flush it.
    pub async fn write_frame(&mut self, message: &serde_json::Value) -> Result<()> {
        let body = serde_json::to_vec(message).context("encoding frame body")?;
        let mut frame = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
        frame.extend_from_slice(&body);

        self.writer
            .write_all(&frame)
            .await
            .context("writing frame")?;
        self.writer.flush().await.context("flushing frame")?;
        Ok(())
    }
}
