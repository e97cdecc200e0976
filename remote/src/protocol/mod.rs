//! The scp control protocol.
//!
//! Control lines are newline-terminated ASCII:
//!
//! | line                    | meaning                          |
//! |-------------------------|----------------------------------|
//! | `T<mtime> 0 <atime> 0`  | times for the next `C`/`D` entry |
//! | `C<mode> <size> <name>` | a regular file, content follows  |
//! | `D<mode> 0 <name>`      | enter a directory                |
//! | `E`                     | leave the current directory      |
//!
//! Every line is answered by a single status byte: `0` means ok, anything else is followed by a
//! newline-terminated message. File content is followed by one extra status round.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const ACK_OK: u8 = 0;
pub const ACK_WARNING: u8 = 1;
pub const ACK_FATAL: u8 = 2;

/// Content is streamed in chunks of this size.
pub const CHUNK_SIZE: usize = 128 * 1024;

const MAX_LINE_LEN: u64 = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("channel i/o failed")]
    Channel(#[source] std::io::Error),
    #[error("local i/o failed for {name:?}")]
    Local {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed control line {line:?}: {reason}")]
    Malformed { line: String, reason: &'static str },
    #[error("unexpected command type {0:?}")]
    UnknownCommand(char),
    #[error("invalid {field} {text:?}")]
    InvalidNumber {
        field: &'static str,
        text: String,
        #[source]
        source: std::num::ParseIntError,
    },
    /// The peer answered with a nonzero status byte; `message` is its text, verbatim.
    #[error("{message}")]
    Rejected { code: u8, message: String },
    #[error("content of {name:?} ended after {actual} of {expected} bytes")]
    ShortContent {
        name: String,
        expected: u64,
        actual: u64,
    },
    #[error("unexpected end of stream")]
    UnexpectedEof,
    #[error("unexpected {got} line, expected {expected}")]
    UnexpectedCommand {
        got: CommandType,
        expected: &'static str,
    },
    #[error("timestamp line not followed by a file or directory")]
    DanglingTime,
}

impl Error {
    /// Whether the error comes from the channel itself rather than from its content.
    pub fn is_channel(&self) -> bool {
        matches!(self, Error::Channel(_) | Error::UnexpectedEof)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    File,
    Dir,
    EndDir,
    Time,
}

impl CommandType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'C' => Some(CommandType::File),
            b'D' => Some(CommandType::Dir),
            b'E' => Some(CommandType::EndDir),
            b'T' => Some(CommandType::Time),
            _ => None,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            CommandType::File => 'C',
            CommandType::Dir => 'D',
            CommandType::EndDir => 'E',
            CommandType::Time => 'T',
        }
    }
}

impl std::fmt::Display for CommandType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlLine {
    Time { mtime: i64, atime: i64 },
    File { mode: u32, size: u64, name: String },
    Dir { mode: u32, name: String },
    EndDir,
}

fn parse_mode(text: &str) -> Result<u32, Error> {
    let mode = u32::from_str_radix(text, 8).map_err(|source| Error::InvalidNumber {
        field: "mode",
        text: text.to_string(),
        source,
    })?;
    if mode & !common::meta::MODE_MASK != 0 || text.starts_with('+') {
        return Err(Error::Malformed {
            line: text.to_string(),
            reason: "mode out of range",
        });
    }
    Ok(mode)
}

fn parse_size(text: &str) -> Result<u64, Error> {
    text.parse().map_err(|source| Error::InvalidNumber {
        field: "size",
        text: text.to_string(),
        source,
    })
}

fn parse_time(field: &'static str, text: &str) -> Result<i64, Error> {
    text.parse().map_err(|source| Error::InvalidNumber {
        field,
        text: text.to_string(),
        source,
    })
}

fn check_name<'a>(line: &str, name: &'a str) -> Result<&'a str, Error> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(Error::Malformed {
            line: line.to_string(),
            reason: "invalid entry name",
        });
    }
    Ok(name)
}

impl ControlLine {
    pub fn command_type(&self) -> CommandType {
        match self {
            ControlLine::Time { .. } => CommandType::Time,
            ControlLine::File { .. } => CommandType::File,
            ControlLine::Dir { .. } => CommandType::Dir,
            ControlLine::EndDir => CommandType::EndDir,
        }
    }

    /// Wire form, including the trailing newline.
    pub fn encode(&self) -> String {
        format!("{self}\n")
    }

    /// Parses one line with the trailing newline already removed.
    pub fn decode(line: &str) -> Result<Self, Error> {
        let Some(&first) = line.as_bytes().first() else {
            return Err(Error::Malformed {
                line: String::new(),
                reason: "empty line",
            });
        };
        let Some(command) = CommandType::from_byte(first) else {
            return Err(Error::UnknownCommand(line.chars().next().unwrap_or('?')));
        };
        let rest = &line[1..];
        let malformed = |reason| Error::Malformed {
            line: line.to_string(),
            reason,
        };
        match command {
            CommandType::EndDir => {
                if !rest.trim_end().is_empty() {
                    return Err(malformed("trailing data after E"));
                }
                Ok(ControlLine::EndDir)
            }
            CommandType::Time => {
                let fields = rest.split(' ').collect::<Vec<_>>();
                let [mtime, mtime_usec, atime, atime_usec] = fields.as_slice() else {
                    return Err(malformed("expected 4 fields"));
                };
                parse_time("mtime microseconds", mtime_usec)?;
                parse_time("atime microseconds", atime_usec)?;
                Ok(ControlLine::Time {
                    mtime: parse_time("mtime", mtime)?,
                    atime: parse_time("atime", atime)?,
                })
            }
            CommandType::File | CommandType::Dir => {
                let mut fields = rest.splitn(3, ' ');
                let (Some(mode), Some(size), Some(name)) =
                    (fields.next(), fields.next(), fields.next())
                else {
                    return Err(malformed("expected mode, size and name"));
                };
                let mode = parse_mode(mode)?;
                let size = parse_size(size)?;
                let name = check_name(line, name)?.to_string();
                if command == CommandType::File {
                    Ok(ControlLine::File { mode, size, name })
                } else {
                    Ok(ControlLine::Dir { mode, name })
                }
            }
        }
    }
}

impl std::fmt::Display for ControlLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlLine::Time { mtime, atime } => write!(f, "T{mtime} 0 {atime} 0"),
            ControlLine::File { mode, size, name } => {
                write!(f, "C{:04o} {size} {name}", mode & common::meta::MODE_MASK)
            }
            ControlLine::Dir { mode, name } => {
                write!(f, "D{:04o} 0 {name}", mode & common::meta::MODE_MASK)
            }
            ControlLine::EndDir => write!(f, "E"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Times {
    pub atime: i64,
    pub mtime: i64,
}

/// One entry decoded from a download stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attr {
    pub kind: CommandType,
    pub mode: u32,
    pub size: u64,
    /// Set when a `T` line preceded the entry.
    pub times: Option<Times>,
    pub name: String,
}

/// Builds [`Attr`]s from decoded lines; a `T` line annotates the immediately following `C`/`D`.
#[derive(Debug, Default)]
pub struct AttrAssembler {
    pending: Option<Times>,
}

impl AttrAssembler {
    /// Returns `None` after a `T` line, the completed entry otherwise.
    pub fn push(&mut self, line: ControlLine) -> Result<Option<Attr>, Error> {
        let attr = match line {
            ControlLine::Time { mtime, atime } => {
                if self.pending.is_some() {
                    return Err(Error::DanglingTime);
                }
                self.pending = Some(Times { atime, mtime });
                return Ok(None);
            }
            ControlLine::File { mode, size, name } => Attr {
                kind: CommandType::File,
                mode,
                size,
                times: self.pending.take(),
                name,
            },
            ControlLine::Dir { mode, name } => Attr {
                kind: CommandType::Dir,
                mode,
                size: 0,
                times: self.pending.take(),
                name,
            },
            ControlLine::EndDir => {
                if self.pending.is_some() {
                    return Err(Error::DanglingTime);
                }
                Attr {
                    kind: CommandType::EndDir,
                    mode: 0,
                    size: 0,
                    times: None,
                    name: String::new(),
                }
            }
        };
        Ok(Some(attr))
    }

    /// Checks that the stream did not end right after a `T` line.
    pub fn finish(&self) -> Result<(), Error> {
        if self.pending.is_some() {
            return Err(Error::DanglingTime);
        }
        Ok(())
    }
}

async fn write_flush<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> Result<(), Error> {
    writer.write_all(bytes).await.map_err(Error::Channel)?;
    writer.flush().await.map_err(Error::Channel)
}

pub async fn send_line<W: AsyncWrite + Unpin>(
    writer: &mut W,
    line: &ControlLine,
) -> Result<(), Error> {
    tracing::trace!("-> {}", line);
    write_flush(writer, line.encode().as_bytes()).await
}

pub async fn send_ack<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<(), Error> {
    write_flush(writer, &[ACK_OK]).await
}

/// Tells the peer an entry failed; the message must not contain a newline.
pub async fn send_error<W: AsyncWrite + Unpin>(writer: &mut W, message: &str) -> Result<(), Error> {
    let mut bytes = vec![ACK_FATAL];
    bytes.extend(message.replace('\n', " ").as_bytes());
    bytes.push(b'\n');
    write_flush(writer, &bytes).await
}

async fn read_message<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<String, Error> {
    let mut message = vec![];
    (&mut *reader)
        .take(MAX_LINE_LEN)
        .read_until(b'\n', &mut message)
        .await
        .map_err(Error::Channel)?;
    Ok(String::from_utf8_lossy(&message).trim_end().to_string())
}

/// Reads one status byte; nonzero turns into [`Error::Rejected`] with the peer's message.
pub async fn read_response<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<(), Error> {
    let code = match reader.read_u8().await {
        Ok(code) => code,
        Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(Error::UnexpectedEof);
        }
        Err(error) => return Err(Error::Channel(error)),
    };
    if code == ACK_OK {
        return Ok(());
    }
    let message = read_message(reader).await?;
    tracing::debug!("peer answered {} with {:?}", code, &message);
    Err(Error::Rejected { code, message })
}

/// Reads the next control line; `None` if the stream ended cleanly before it.
///
/// A status byte where a line is expected means the peer reports an error instead of an entry.
pub async fn read_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<Option<ControlLine>, Error> {
    let mut bytes = vec![];
    let count = (&mut *reader)
        .take(MAX_LINE_LEN)
        .read_until(b'\n', &mut bytes)
        .await
        .map_err(Error::Channel)?;
    if count == 0 {
        return Ok(None);
    }
    if bytes[0] == ACK_WARNING || bytes[0] == ACK_FATAL {
        let message = String::from_utf8_lossy(&bytes[1..]).trim_end().to_string();
        return Err(Error::Rejected {
            code: bytes[0],
            message,
        });
    }
    if bytes.last() != Some(&b'\n') {
        if count as u64 == MAX_LINE_LEN {
            return Err(Error::Malformed {
                line: String::from_utf8_lossy(&bytes[..64]).to_string(),
                reason: "line too long",
            });
        }
        return Err(Error::UnexpectedEof);
    }
    bytes.pop();
    let text = String::from_utf8_lossy(&bytes);
    tracing::trace!("<- {}", &text);
    ControlLine::decode(&text).map(Some)
}
