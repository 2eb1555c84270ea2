// ABOUTME: Minimal SCP wire codec: sink side for uploads, source side for downloads.
// ABOUTME: Works over any async byte streams so it can be exercised without SSH.

use crate::error::{Error, ErrorKind, Result};
use std::fmt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const FILE_RECORD: u8 = b'C';
const TIME_RECORD: u8 = b'T';
const DIR_RECORD: u8 = b'D';
const END_DIR_RECORD: u8 = b'E';
const WARNING: u8 = 0x01;
const FATAL: u8 = 0x02;
const OK: u8 = 0x00;

/// Longest header line accepted from a remote source.
const MAX_HEADER_LEN: u64 = 4096;

fn protocol(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::Protocol(message.into()))
}

fn io(context: &'static str) -> impl FnOnce(std::io::Error) -> Error {
    move |e| Error::io(context, e)
}

/// The `C<mode> <length> <name>` record announcing one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    /// Permission bits, printed in octal.
    pub mode: u32,
    pub length: u64,
    pub name: String,
}

impl FileHeader {
    pub fn new(mode: u32, length: u64, name: impl Into<String>) -> Self {
        Self {
            mode: mode & 0o7777,
            length,
            name: name.into(),
        }
    }

    /// Parse the part of a header line following the `C` record byte.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let mut parts = line.splitn(3, ' ');
        let (Some(mode), Some(length), Some(name)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(protocol(format!("malformed file header: {line:?}")));
        };

        let mode = u32::from_str_radix(mode, 8)
            .ok()
            .filter(|m| *m <= 0o7777)
            .ok_or_else(|| protocol(format!("invalid file mode {mode:?}")))?;
        let length = length
            .parse::<u64>()
            .map_err(|_| protocol(format!("invalid file length {length:?}")))?;
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(protocol(format!("refusing file name {name:?}")));
        }

        Ok(Self {
            mode,
            length,
            name: name.to_string(),
        })
    }
}

impl fmt::Display for FileHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "C{:04o} {} {}", self.mode, self.length, self.name)
    }
}

/// Drive the sink (`scp -t`) side: header, exactly `header.length` bytes of
/// `body`, then a single NUL. The writer is flushed but left open.
pub async fn send_file<W, R>(writer: &mut W, header: &FileHeader, body: R) -> Result<()>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    writer
        .write_all(header.to_string().as_bytes())
        .await
        .map_err(io("cannot write scp header"))?;

    let copied = tokio::io::copy(&mut body.take(header.length), writer)
        .await
        .map_err(io("cannot stream file to scp"))?;
    if copied != header.length {
        return Err(protocol(format!(
            "short copy: announced {} bytes, sent {}",
            header.length, copied
        )));
    }

    writer
        .write_all(&[OK])
        .await
        .map_err(io("cannot terminate scp transfer"))?;
    writer.flush().await.map_err(io("cannot flush scp stream"))
}

async fn ack<W: AsyncWrite + Unpin>(acks: &mut W) -> Result<()> {
    acks.write_all(&[OK])
        .await
        .map_err(io("cannot acknowledge scp record"))?;
    acks.flush().await.map_err(io("cannot acknowledge scp record"))
}

async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<String> {
    let mut line = Vec::new();
    (&mut *reader)
        .take(MAX_HEADER_LEN)
        .read_until(b'\n', &mut line)
        .await
        .map_err(io("cannot read scp record"))?;
    if line.last() != Some(&b'\n') {
        return Err(protocol("unterminated scp record"));
    }
    String::from_utf8(line).map_err(|_| protocol("scp record is not valid UTF-8"))
}

async fn read_byte<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<u8>> {
    let mut byte = [0u8; 1];
    match reader.read(&mut byte).await.map_err(io("cannot read scp stream"))? {
        0 => Ok(None),
        _ => Ok(Some(byte[0])),
    }
}

/// Drive the source (`scp -f`) side up to and including the file header.
///
/// Sends the initial acknowledgement, then skips control bytes until the
/// `C` record. Remote warnings and errors, directory records, or the stream
/// ending first are protocol errors.
pub async fn read_header<R, W>(reader: &mut R, acks: &mut W) -> Result<FileHeader>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    ack(acks).await?;

    loop {
        let Some(record) = read_byte(reader).await? else {
            return Err(protocol("stream ended before a file header"));
        };
        match record {
            FILE_RECORD => break,
            TIME_RECORD => {
                read_line(reader).await?;
                ack(acks).await?;
            }
            WARNING | FATAL => {
                let message = read_line(reader).await.unwrap_or_default();
                return Err(protocol(format!("remote scp: {}", message.trim_end())));
            }
            DIR_RECORD | END_DIR_RECORD => {
                return Err(protocol("directory transfers are not supported"));
            }
            _ => {}
        }
    }

    let header = FileHeader::parse(&read_line(reader).await?)?;
    ack(acks).await?;
    Ok(header)
}

/// Copy exactly `header.length` bytes into `out`, then consume the source's
/// completion status and acknowledge it.
pub async fn read_body<R, W, O>(
    reader: &mut R,
    acks: &mut W,
    header: &FileHeader,
    out: &mut O,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    O: AsyncWrite + Unpin,
{
    let copied = tokio::io::copy(&mut (&mut *reader).take(header.length), out)
        .await
        .map_err(io("cannot copy scp body"))?;
    if copied != header.length {
        return Err(protocol(format!(
            "short read: announced {} bytes, received {}",
            header.length, copied
        )));
    }
    out.flush().await.map_err(io("cannot flush downloaded file"))?;

    match read_byte(reader).await? {
        Some(OK) => ack(acks).await,
        Some(WARNING | FATAL) => {
            let message = read_line(reader).await.unwrap_or_default();
            Err(protocol(format!("remote scp: {}", message.trim_end())))
        }
        Some(other) => Err(protocol(format!("unexpected status byte {other:#04x}"))),
        None => Err(protocol("stream ended before transfer status")),
    }
}
