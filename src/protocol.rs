use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Upper bound on file bytes moved per read/write during a transfer.
pub const CHUNK_SIZE: usize = 1024;

pub const DOWNLOAD_USAGE: &str = "Usage: /download <filename> <destination directory>";
pub const PM_USAGE: &str = "Usage: /pm <username> <message>";

/// One client request, decoded from a single line of input.
///
/// Anything that is not a recognized, well-formed command falls through to
/// [`Command::Broadcast`], so a typo'd slash command is relayed as ordinary
/// chat rather than rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Broadcast(String),
    Leave,
    ListFiles,
    Download { filename: String, dest_dir: String },
    PrivateMessage { to: String, body: String },
    Malformed { usage: &'static str },
}

impl Command {
    pub fn parse(line: &str) -> Command {
        if line.starts_with("/leave") {
            Command::Leave
        } else if line.starts_with("/list") {
            Command::ListFiles
        } else if line.starts_with("/download") {
            parse_download(line)
        } else if line.starts_with("/pm") {
            parse_private_message(line)
        } else {
            Command::Broadcast(line.to_string())
        }
    }
}

fn parse_download(line: &str) -> Command {
    let mut parts = line.split_whitespace();
    let _command = parts.next();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(filename), Some(dest_dir), None) => Command::Download {
            filename: filename.to_string(),
            dest_dir: dest_dir.to_string(),
        },
        _ => Command::Malformed {
            usage: DOWNLOAD_USAGE,
        },
    }
}

/// The target username is the token between the first and second whitespace
/// runs; the rest of the line is the message body. Usernames with embedded
/// spaces are therefore not addressable over this protocol.
fn parse_private_message(line: &str) -> Command {
    let rest = line["/pm".len()..].trim_start();
    let Some((to, body)) = rest.split_once(char::is_whitespace) else {
        return Command::Malformed { usage: PM_USAGE };
    };
    let body = body.trim_start();
    if to.is_empty() || body.is_empty() {
        return Command::Malformed { usage: PM_USAGE };
    }
    Command::PrivateMessage {
        to: to.to_string(),
        body: body.to_string(),
    }
}

/// Header line announcing a file transfer to the receiving client. The
/// `len` count is what tells the receiver where the raw body ends; there is
/// no in-band terminator, so body bytes are never interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferHeader {
    pub filename: String,
    pub dest_dir: String,
    pub len: u64,
}

impl TransferHeader {
    pub fn encode(&self) -> String {
        format!("/download {} {} {}", self.filename, self.dest_dir, self.len)
    }

    pub fn parse(line: &str) -> Option<TransferHeader> {
        let mut parts = line.split_whitespace();
        if parts.next() != Some("/download") {
            return None;
        }
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(filename), Some(dest_dir), Some(len), None) => Some(TransferHeader {
                filename: filename.to_string(),
                dest_dir: dest_dir.to_string(),
                len: len.parse().ok()?,
            }),
            _ => None,
        }
    }
}

pub fn welcome(username: &str) -> String {
    format!("Welcome to the chat, {username}!")
}

pub fn joined(username: &str) -> String {
    format!("{username} has joined the chat.")
}

pub fn left(username: &str) -> String {
    format!("{username} has left the chat.")
}

pub fn chat_line(sender: &str, text: &str) -> String {
    format!("{sender}: {text}")
}

pub fn private_line(sender: &str, to: &str, body: &str) -> String {
    format!("{sender} to {to}: {body}")
}

pub fn not_online(username: &str) -> String {
    format!("{username} is not online")
}

pub fn missing_file(filename: &str) -> String {
    format!("{filename} doesn't exist")
}

pub fn file_list(names: &[String]) -> String {
    let mut listing = String::from("Files for download:");
    for name in names {
        listing.push('\n');
        listing.push_str(name);
    }
    listing
}

pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    // Line-oriented framing keeps interoperability with netcat-style tools.
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }

        return Ok(Some(trimmed.to_string()));
    }
}

pub async fn write_line<W>(writer: &mut W, message: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    // Append the newline delimiter and flush so peers get timely updates.
    writer.write_all(message.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
