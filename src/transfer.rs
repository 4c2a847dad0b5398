use std::{
    io,
    path::{Path, PathBuf},
};

use tokio::{
    fs::{self, File},
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
};
use tracing::debug;

use crate::protocol::{self, CHUNK_SIZE, TransferHeader};

/// Streams one file from `root` to the requesting client.
///
/// The receiver gets a header line carrying the file's byte count, then
/// exactly that many raw bytes in bounded chunks. A request that cannot be
/// served (missing file, or a name that tries to escape `root`) is answered
/// with a textual notice on the same stream and is not an error here; only
/// I/O failures propagate, and those end the requester's session.
pub async fn send_file<W>(
    root: &Path,
    filename: &str,
    dest_dir: &str,
    writer: &mut W,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if !is_plain_name(filename) {
        debug!(filename, "refused download request for non-plain filename");
        return protocol::write_line(writer, &protocol::missing_file(filename)).await;
    }

    let path = root.join(filename);
    let mut file = match File::open(&path).await {
        Ok(file) => file,
        Err(error) => {
            debug!(?error, filename, "download request for unreadable file");
            return protocol::write_line(writer, &protocol::missing_file(filename)).await;
        }
    };

    let len = file.metadata().await?.len();
    let header = TransferHeader {
        filename: filename.to_string(),
        dest_dir: dest_dir.to_string(),
        len,
    };
    protocol::write_line(writer, &header.encode()).await?;

    let mut chunk = [0u8; CHUNK_SIZE];
    let mut remaining = len;
    while remaining > 0 {
        let want = remaining.min(CHUNK_SIZE as u64) as usize;
        let read = file.read(&mut chunk[..want]).await?;
        if read == 0 {
            // The file shrank under us; the header's byte count is already
            // on the wire, so the stream cannot be rescued.
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{filename} truncated while sending"),
            ));
        }
        writer.write_all(&chunk[..read]).await?;
        remaining -= read as u64;
    }
    writer.flush().await?;
    Ok(())
}

/// Reads the body announced by `header` and writes it to
/// `<dest_dir>/<filename>`, creating the directory if needed.
///
/// The byte count from the header decides where the body ends, so the file
/// content is never scanned or interpreted. A stream that ends early is an
/// error, not a short success.
pub async fn receive_file<R>(header: &TransferHeader, reader: &mut R) -> io::Result<PathBuf>
where
    R: AsyncRead + Unpin,
{
    fs::create_dir_all(&header.dest_dir).await?;
    let path = Path::new(&header.dest_dir).join(&header.filename);
    let mut file = File::create(&path).await?;

    let mut chunk = [0u8; CHUNK_SIZE];
    let mut remaining = header.len;
    while remaining > 0 {
        let want = remaining.min(CHUNK_SIZE as u64) as usize;
        let read = reader.read(&mut chunk[..want]).await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "connection closed with {remaining} of {} bytes outstanding",
                    header.len
                ),
            ));
        }
        file.write_all(&chunk[..read]).await?;
        remaining -= read as u64;
    }
    file.flush().await?;
    Ok(path)
}

/// Download requests may only name entries directly under the download
/// root; separators and parent components are refused.
fn is_plain_name(filename: &str) -> bool {
    !filename.is_empty() && !filename.contains(['/', '\\']) && filename != ".." && filename != "."
}
