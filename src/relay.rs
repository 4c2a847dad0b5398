use std::{future::Future, net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Result;
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream},
    select,
    sync::mpsc,
};
use tracing::{debug, info, warn};

use crate::{
    protocol::{self, Command},
    registry::{Registry, SessionId},
    transfer,
};

const DEFAULT_DOWNLOAD_ROOT: &str = "downloads";

/// The relay server: accepts connections and runs one worker task per
/// client session until asked to shut down.
pub struct Relay {
    listener: TcpListener,
    state: Arc<RelayState>,
}

impl Relay {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            state: Arc::new(RelayState::new(PathBuf::from(DEFAULT_DOWNLOAD_ROOT))),
        }
    }

    /// Points `/list` and `/download` at a different directory. Served
    /// files are always resolved directly under this root.
    pub fn with_download_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.state = Arc::new(RelayState::new(root.into()));
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Relay { listener, state } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("relay shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

struct RelayState {
    registry: Registry,
    download_root: PathBuf,
}

impl RelayState {
    fn new(download_root: PathBuf) -> Self {
        Self {
            registry: Registry::new(),
            download_root,
        }
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<RelayState>,
) {
    match result {
        Ok((stream, peer)) => spawn_session_worker(stream, peer, state),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_session_worker(stream: TcpStream, peer: SocketAddr, state: &Arc<RelayState>) {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, state).await {
            warn!(peer = %peer, error = ?err, "client connection closed with error");
        }
    });
}

async fn handle_connection(stream: TcpStream, state: Arc<RelayState>) -> Result<()> {
    let peer = stream.peer_addr().ok();
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    // Handshake: the first line is the display name, taken as-is. No
    // uniqueness check.
    let username = match protocol::read_line(&mut reader).await? {
        Some(line) => line,
        None => anyhow::bail!("connection closed before username handshake"),
    };

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let id = state.registry.register(username.clone(), outbound_tx).await;
    info!(?peer, username, session = id, "client joined");

    let result = run_session(
        &state,
        id,
        &username,
        &mut reader,
        &mut writer,
        &mut outbound_rx,
    )
    .await;

    // Peer close, explicit leave, and I/O errors all converge here; the
    // registry's idempotent removal keeps this a single logical close.
    if let Some(username) = state.registry.unregister(id).await {
        info!(?peer, username, session = id, "client disconnected");
    }

    result
}

/// Runs one `Active` session from greeting to teardown: lines read from
/// the socket are dispatched, messages queued by other workers are written
/// out. Only this task ever writes to the connection, so each queued
/// message (and each file transfer) reaches the wire whole.
async fn run_session<R, W>(
    state: &Arc<RelayState>,
    id: SessionId,
    username: &str,
    reader: &mut R,
    writer: &mut W,
    outbound: &mut mpsc::UnboundedReceiver<String>,
) -> Result<()>
where
    R: tokio::io::AsyncBufRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    protocol::write_line(writer, &protocol::welcome(username)).await?;
    broadcast(state, id, protocol::joined(username)).await;

    loop {
        select! {
            line = protocol::read_line(reader) => {
                match line? {
                    Some(text) => {
                        if !dispatch(state, id, username, writer, &text).await? {
                            return Ok(());
                        }
                    }
                    None => return Ok(()),
                }
            }
            queued = outbound.recv() => {
                match queued {
                    Some(message) => protocol::write_line(writer, &message).await?,
                    None => return Ok(()),
                }
            }
        }
    }
}

/// Routes one decoded client line. Returns `false` when the session asked
/// to end.
async fn dispatch<W>(
    state: &Arc<RelayState>,
    sender_id: SessionId,
    sender: &str,
    writer: &mut W,
    line: &str,
) -> Result<bool>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    match Command::parse(line) {
        Command::Broadcast(text) => {
            broadcast(state, sender_id, protocol::chat_line(sender, &text)).await;
            Ok(true)
        }
        Command::Leave => {
            broadcast(state, sender_id, protocol::left(sender)).await;
            state.registry.unregister(sender_id).await;
            Ok(false)
        }
        Command::ListFiles => {
            protocol::write_line(writer, &list_download_root(state).await).await?;
            Ok(true)
        }
        Command::PrivateMessage { to, body } => {
            unicast(state, sender, writer, &to, &body).await?;
            Ok(true)
        }
        Command::Download { filename, dest_dir } => {
            transfer::send_file(&state.download_root, &filename, &dest_dir, writer).await?;
            Ok(true)
        }
        Command::Malformed { usage } => {
            protocol::write_line(writer, usage).await?;
            Ok(true)
        }
    }
}

/// Queues `message` for every live session except `from`. A session whose
/// worker has already gone away is pruned and the loop carries on; one dead
/// recipient never costs the others their copy.
async fn broadcast(state: &Arc<RelayState>, from: SessionId, message: String) {
    let recipients = state.registry.snapshot().await;
    for (id, _, outbound) in recipients {
        if id == from {
            continue;
        }
        if outbound.send(message.clone()).is_err() {
            state.registry.unregister(id).await;
            debug!(session = id, "pruned dead session during broadcast");
        }
    }
}

/// Delivers a private message to the first session registered under `to`,
/// or tells the sender nobody is there. Usernames are not unique; later
/// registrations under the same name are shadowed.
async fn unicast<W>(
    state: &Arc<RelayState>,
    sender: &str,
    writer: &mut W,
    to: &str,
    body: &str,
) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    match state.registry.lookup_by_username(to).await {
        Some((id, outbound)) => {
            if outbound
                .send(protocol::private_line(sender, to, body))
                .is_err()
            {
                state.registry.unregister(id).await;
                debug!(session = id, "pruned dead session during unicast");
                protocol::write_line(writer, &protocol::not_online(to)).await?;
            }
        }
        None => {
            protocol::write_line(writer, &protocol::not_online(to)).await?;
        }
    }
    Ok(())
}

async fn list_download_root(state: &Arc<RelayState>) -> String {
    let mut names = Vec::new();
    let mut entries = match tokio::fs::read_dir(&state.download_root).await {
        Ok(entries) => entries,
        Err(error) => {
            debug!(?error, root = %state.download_root.display(), "failed to read download root");
            return "No files are available for download".to_string();
        }
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Ok(name) = entry.file_name().into_string() {
            names.push(name);
        }
    }
    // read_dir order is platform-dependent; present a stable listing.
    names.sort();
    protocol::file_list(&names)
}
