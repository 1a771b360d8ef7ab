//! Wire Framing: `\n`-terminated command/reply lines plus exact-size blob
//! transfers with no framing of their own.
//!
//! `tokio`'s `AsyncReadExt::read_exact` already loops internally past short
//! reads and `Interrupted`, so there is no manual retry loop here.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::CsapResult;

/// Read one line, stripping the trailing `\n` and any `\r`. `Ok(None)` on a
/// clean EOF with no partial data.
pub async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> CsapResult<Option<String>> {
    let mut buf = String::new();
    let n = reader.read_line(&mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    while buf.ends_with('\n') || buf.ends_with('\r') {
        buf.pop();
    }
    Ok(Some(buf))
}

/// Write `line` terminated by exactly one `\n`, appending it if the caller
/// didn't include one.
pub async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> CsapResult<()> {
    writer.write_all(line.as_bytes()).await?;
    if !line.ends_with('\n') {
        writer.write_all(b"\n").await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Write exactly `data.len()` bytes with no additional framing.
pub async fn send_blob<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> CsapResult<()> {
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Read exactly `size` bytes with no additional framing.
pub async fn recv_blob<R: AsyncRead + Unpin>(reader: &mut R, size: usize) -> CsapResult<Vec<u8>> {
    let mut buf = vec![0u8; size];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}
