use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn cli_chat_and_download_end_to_end() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("chat-relay");

    // The server reads files from `downloads/` under its working
    // directory; the client saves into a directory of its own.
    let server_dir = tempfile::tempdir().context("server dir")?;
    std::fs::create_dir(server_dir.path().join("downloads")).context("downloads dir")?;
    std::fs::write(
        server_dir.path().join("downloads").join("report.txt"),
        b"quarterly numbers\n",
    )
    .context("download fixture")?;
    let client_dir = tempfile::tempdir().context("client dir")?;

    let (mut server_child, mut server_stdout) = spawn_server(&binary, server_dir.path()).await?;
    let addr = read_server_addr(&mut server_stdout).await?;
    let port = addr
        .rsplit(':')
        .next()
        .context("address missing port")?
        .to_string();

    // Drain further server output in the background so the pipe never fills.
    let server_log_task = tokio::spawn(async move {
        drain_stdout(server_stdout).await;
    });

    let mut alice = spawn_client(&binary, "alice", &port, client_dir.path()).await?;
    let mut bob = spawn_client(&binary, "bob", &port, client_dir.path()).await?;

    // Alice observes Bob's arrival.
    let alice_sees_bob =
        read_line_expect(&mut alice.stdout, "waiting for alice join notice").await?;
    assert_eq!(alice_sees_bob, "bob has joined the chat.");

    // Alice greets the room; the broadcast reaches Bob but is not echoed
    // back to Alice.
    alice
        .send_line("Hello from Alice")
        .await
        .context("alice send line")?;
    let bob_hears_alice =
        read_line_expect(&mut bob.stdout, "waiting for bob to hear alice").await?;
    assert_eq!(bob_hears_alice, "alice: Hello from Alice");

    // Bob replies privately; only Alice sees it.
    bob.send_line("/pm alice good to see you")
        .await
        .context("bob send pm")?;
    let alice_hears_bob =
        read_line_expect(&mut alice.stdout, "waiting for alice to hear bob").await?;
    assert_eq!(alice_hears_bob, "bob to alice: good to see you");

    // Alice asks what is available and downloads it.
    alice.send_line("/list").await.context("alice send list")?;
    let list_banner = read_line_expect(&mut alice.stdout, "waiting for file list banner").await?;
    assert_eq!(list_banner, "Files for download:");
    let listed = read_line_expect(&mut alice.stdout, "waiting for file list entry").await?;
    assert_eq!(listed, "report.txt");

    alice
        .send_line("/download report.txt saved")
        .await
        .context("alice send download")?;
    let request_sent =
        read_line_expect(&mut alice.stdout, "waiting for download request notice").await?;
    assert_eq!(
        request_sent,
        "File download request sent. Waiting for server response..."
    );
    let downloaded = read_line_expect(&mut alice.stdout, "waiting for download to finish").await?;
    assert_eq!(downloaded, "File Downloaded");
    let saved = std::fs::read(client_dir.path().join("saved").join("report.txt"))
        .context("read downloaded file")?;
    assert_eq!(saved, b"quarterly numbers\n");

    // Alice leaves; Bob receives the departure notice.
    alice.send_line("/leave").await.context("alice send leave")?;
    let alice_leaving =
        read_line_expect(&mut alice.stdout, "waiting for alice leave confirmation").await?;
    assert_eq!(alice_leaving, "Logging off...");
    let bob_sees_departure =
        read_line_expect(&mut bob.stdout, "waiting for bob to see alice leave").await?;
    assert_eq!(bob_sees_departure, "alice has left the chat.");

    bob.send_line("/leave").await.context("bob send leave")?;
    let bob_leaving =
        read_line_expect(&mut bob.stdout, "waiting for bob leave confirmation").await?;
    assert_eq!(bob_leaving, "Logging off...");

    ensure_success(&mut alice.child, "alice client").await?;
    ensure_success(&mut bob.child, "bob client").await?;

    // The relay stays up after clients disconnect; terminate it manually.
    let _ = server_child.kill().await;
    let _ = server_child.wait().await;
    let _ = server_log_task.await;

    Ok(())
}

struct ClientProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl ClientProcess {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.stdin
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to send line '{line}'"))?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }
}

async fn spawn_server(binary: &Path, workdir: &Path) -> Result<(Child, BufReader<ChildStdout>)> {
    let mut cmd = Command::new(binary);
    cmd.arg("serve")
        .arg("0")
        .current_dir(workdir)
        .env("RUST_LOG", "warn")
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    let mut child = cmd.spawn().context("failed to spawn server")?;
    let stdout = child
        .stdout
        .take()
        .context("server stdout missing after spawn")?;

    Ok((child, BufReader::new(stdout)))
}

async fn read_server_addr(reader: &mut BufReader<ChildStdout>) -> Result<String> {
    let line = read_line(reader)
        .await?
        .context("server did not emit listening address")?;
    let trimmed = line.trim();
    let addr = trimmed
        .split_whitespace()
        .last()
        .context("unexpected server banner format")?;
    if !addr.contains(':') {
        return Err(anyhow!("server banner missing socket: {trimmed}"));
    }
    Ok(addr.to_string())
}

async fn spawn_client(
    binary: &Path,
    username: &str,
    port: &str,
    workdir: &Path,
) -> Result<ClientProcess> {
    let mut cmd = Command::new(binary);
    cmd.arg("client")
        .arg(username)
        .arg("127.0.0.1")
        .arg(port)
        .current_dir(workdir)
        .env("RUST_LOG", "warn")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn client {username}"))?;

    let stdin = child
        .stdin
        .take()
        .context("client stdin missing after spawn")?;
    let stdout = child
        .stdout
        .take()
        .context("client stdout missing after spawn")?;

    let mut process = ClientProcess {
        child,
        stdin,
        stdout: BufReader::new(stdout),
    };

    let welcome = read_line_expect(&mut process.stdout, "waiting for welcome banner").await?;
    if welcome != format!("Welcome to the chat, {username}!") {
        return Err(anyhow!(
            "expected welcome banner for {username}, got '{welcome}'"
        ));
    }

    Ok(process)
}

async fn read_line_expect(
    reader: &mut BufReader<ChildStdout>,
    description: &str,
) -> Result<String> {
    match read_line(reader).await {
        Ok(Some(line)) => Ok(line),
        Ok(None) => Err(anyhow!("{description}: stream closed")),
        Err(err) => Err(err.context(format!("{description}: failed to read line"))),
    }
}

async fn read_line(reader: &mut BufReader<ChildStdout>) -> Result<Option<String>> {
    let mut line = String::new();
    let read_future = reader.read_line(&mut line);
    let bytes_io = match timeout(READ_TIMEOUT, read_future).await {
        Ok(result) => result,
        Err(_) => return Err(anyhow!("timed out waiting for line")),
    };
    let byte_count = bytes_io?;
    if byte_count == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

async fn drain_stdout(mut reader: BufReader<ChildStdout>) {
    let mut buffer = String::new();
    while reader
        .read_line(&mut buffer)
        .await
        .map(|bytes| {
            let has_data = bytes > 0;
            if has_data {
                buffer.clear();
            }
            has_data
        })
        .unwrap_or(false)
    {}
}

async fn ensure_success(child: &mut Child, name: &str) -> Result<()> {
    let status = child
        .wait()
        .await
        .with_context(|| format!("failed to await {name} process"))?;
    if !status.success() {
        return Err(anyhow!("{name} exited with status {status}"));
    }
    Ok(())
}
