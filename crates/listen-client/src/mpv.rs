/// mpv JSON IPC.
///
/// ```text
///   MpvDriver::spawn_and_connect()
///         │
///         └── connection task (owns the socket and the in-flight table)
///               ├── Request from MpvHandle  → tag with request_id, write line
///               ├── line with request_id    → resolve the waiting Request
///               └── any other line          → MpvEvent on event_tx
/// ```
///
/// When the socket closes every in-flight request fails, and the handle's
/// sends fail from then on.  Unix domain sockets on Unix, named pipes
/// (`\\.\pipe\<name>`) on Windows.
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_ATTEMPTS: u32 = 50;
const CONNECT_POLL: Duration = Duration::from_millis(100);

// observe_property ids
pub const OBS_CORE_IDLE: u64 = 1;
pub const OBS_PAUSE: u64 = 2;

type Reply = oneshot::Sender<anyhow::Result<Value>>;

struct Request {
    command: Value,
    reply: Reply,
}

/// A line mpv pushed without being asked: an event or a property change.
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    /// `Some((observe id, data))` for property-change events.
    pub fn as_property_change(&self) -> Option<(u64, &Value)> {
        if self.event_name()? != "property-change" {
            return None;
        }
        let id = self.raw.get("id")?.as_u64()?;
        Some((id, self.raw.get("data").unwrap_or(&Value::Null)))
    }

    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }

    /// `reason` of an `end-file` event: eof, error, stop, quit...
    pub fn end_reason(&self) -> Option<&str> {
        self.raw.get("reason")?.as_str()
    }
}

// ── handle ────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<Request>,
}

impl MpvHandle {
    /// Send one command and wait for mpv's reply.
    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let (reply, reply_rx) = oneshot::channel();
        let name = command.get(0).and_then(Value::as_str).unwrap_or("?").to_string();
        self.tx
            .send(Request { command, reply })
            .await
            .map_err(|_| anyhow::anyhow!("mpv connection is closed"))?;

        match tokio::time::timeout(REPLY_TIMEOUT, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => anyhow::bail!("mpv dropped the reply to {}", name),
            Err(_) => anyhow::bail!("mpv did not answer {} within {:?}", name, REPLY_TIMEOUT),
        }
    }

    pub async fn load_stream(&self, url: &str) -> anyhow::Result<()> {
        self.send(json!(["loadfile", url, "replace"])).await?;
        Ok(())
    }

    /// Best effort; mpv may already be idle.
    pub async fn stop(&self) -> anyhow::Result<()> {
        if let Err(e) = self.send(json!(["stop"])).await {
            debug!("mpv: stop: {}", e);
        }
        Ok(())
    }

    pub async fn set_volume(&self, volume: u8) -> anyhow::Result<()> {
        self.send(json!(["set_property", "volume", volume.min(100)]))
            .await?;
        Ok(())
    }

    pub async fn set_pause(&self, paused: bool) -> anyhow::Result<()> {
        self.send(json!(["set_property", "pause", paused])).await?;
        Ok(())
    }

    /// Jump to the newest buffered audio, i.e. the live edge of the stream.
    pub async fn seek_to_live_edge(&self) -> anyhow::Result<()> {
        self.send(json!(["seek", -4, "absolute+keyframes"])).await?;
        Ok(())
    }

    /// Needed once per connection; mpv forgets observers with the socket.
    pub async fn observe_properties(&self) {
        for (id, name) in [(OBS_CORE_IDLE, "core-idle"), (OBS_PAUSE, "pause")] {
            if let Err(e) = self.send(json!(["observe_property", id, name])).await {
                warn!("mpv: could not observe {}: {}", name, e);
            }
        }
    }

    /// Cheap round trip used by the heartbeat.
    pub async fn ping(&self) -> anyhow::Result<()> {
        self.send(json!(["get_property", "idle-active"])).await?;
        Ok(())
    }
}

// ── driver ────────────────────────────────────────────────────────────────────

/// Owns the mpv child process.
pub struct MpvDriver {
    socket_name: String,
    process: Option<tokio::process::Child>,
    /// `--key=value` arguments from `[player]`.
    extra_args: Vec<String>,
    /// Volume the next process starts with.
    pub volume: u8,
}

impl MpvDriver {
    pub fn new(extra_args: Vec<String>, volume: u8) -> Self {
        Self {
            socket_name: listen_proto::platform::mpv_socket_name(),
            process: None,
            extra_args,
            volume,
        }
    }

    pub fn process_alive(&mut self) -> bool {
        match self.process.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub async fn kill(&mut self) {
        if let Some(mut child) = self.process.take() {
            if let Err(e) = child.kill().await {
                debug!("mpv: kill: {}", e);
            }
        }
    }

    fn spawn_process(&mut self) -> anyhow::Result<()> {
        let binary = listen_proto::platform::find_mpv_binary()
            .ok_or_else(|| anyhow::anyhow!("mpv binary not found (set MPV_PATH)"))?;
        info!("mpv: starting {:?}", binary);

        let child = tokio::process::Command::new(binary)
            .args(["--no-video", "--idle=yes", "--quiet", "--no-terminal"])
            .arg(listen_proto::platform::mpv_socket_arg(&self.socket_name))
            .arg(format!("--volume={}", self.volume.min(100)))
            .args(&self.extra_args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        self.process = Some(child);
        Ok(())
    }

    /// Start a fresh mpv (killing any previous one) and connect to its IPC.
    #[cfg(unix)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        self.kill().await;
        let socket_path = std::path::PathBuf::from(&self.socket_name);
        let _ = tokio::fs::remove_file(&socket_path).await;
        self.spawn_process()?;

        for _ in 0..CONNECT_ATTEMPTS {
            tokio::time::sleep(CONNECT_POLL).await;
            if !self.process_alive() {
                anyhow::bail!("mpv exited during startup");
            }
            // The socket file can exist a moment before mpv listens on it.
            if let Ok(stream) = UnixStream::connect(&socket_path).await {
                info!("mpv: connected to {:?}", socket_path);
                let (read_half, write_half) = stream.into_split();
                return Ok(connect(read_half, write_half, event_tx));
            }
        }
        self.kill().await;
        anyhow::bail!("mpv IPC socket {:?} never accepted a connection", socket_path)
    }

    #[cfg(windows)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        self.kill().await;
        self.spawn_process()?;

        let pipe_path = format!(r"\\.\pipe\{}", self.socket_name);
        for _ in 0..CONNECT_ATTEMPTS {
            tokio::time::sleep(CONNECT_POLL).await;
            if !self.process_alive() {
                anyhow::bail!("mpv exited during startup");
            }
            if let Ok(pipe) = ClientOptions::new().open(&pipe_path) {
                info!("mpv: connected to {}", pipe_path);
                let (read_half, write_half) = tokio::io::split(pipe);
                return Ok(connect(read_half, write_half, event_tx));
            }
        }
        self.kill().await;
        anyhow::bail!("mpv named pipe {} never appeared", pipe_path)
    }
}

impl Drop for MpvDriver {
    fn drop(&mut self) {
        #[cfg(unix)]
        let _ = std::fs::remove_file(&self.socket_name);
    }
}

// ── connection task ───────────────────────────────────────────────────────────

fn connect<R, W>(reader: R, writer: W, event_tx: mpsc::Sender<MpvEvent>) -> MpvHandle
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(run_connection(BufReader::new(reader), writer, rx, event_tx));
    MpvHandle { tx }
}

async fn run_connection<R, W>(
    reader: BufReader<R>,
    mut writer: W,
    mut requests: mpsc::Receiver<Request>,
    event_tx: mpsc::Sender<MpvEvent>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    let mut in_flight: HashMap<u64, Reply> = HashMap::new();
    let mut next_id: u64 = 1;

    let reason = loop {
        tokio::select! {
            req = requests.recv() => {
                let Some(req) = req else { break "handle dropped".to_string() };
                let id = next_id;
                next_id += 1;
                let line = format!("{}\n", json!({ "command": req.command, "request_id": id }));
                debug!("mpv: → #{} {}", id, req.command);
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    let _ = req.reply.send(Err(anyhow::anyhow!("mpv write failed: {}", e)));
                    break format!("write failed: {}", e);
                }
                in_flight.insert(id, req.reply);
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let Some(msg) = decode_line(&line) else { continue };
                    match msg.get("request_id").and_then(Value::as_u64) {
                        Some(id) => match in_flight.remove(&id) {
                            Some(reply) => {
                                let _ = reply.send(reply_result(msg));
                            }
                            None => debug!("mpv: reply to unknown request #{}", id),
                        },
                        None => {
                            if event_tx.send(MpvEvent { raw: msg }).await.is_err() {
                                break "event receiver dropped".to_string();
                            }
                        }
                    }
                }
                Ok(None) => break "connection closed".to_string(),
                Err(e) => {
                    warn!("mpv: read failed: {}", e);
                    break format!("read failed: {}", e);
                }
            },
        }
    };

    debug!("mpv: connection ended ({}), failing {} request(s)", reason, in_flight.len());
    for (_, reply) in in_flight.drain() {
        let _ = reply.send(Err(anyhow::anyhow!("mpv IPC {}", reason)));
    }
}

fn decode_line(line: &str) -> Option<Value> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(value) => Some(value),
        Err(e) => {
            debug!("mpv: unparseable line {:?}: {}", line, e);
            None
        }
    }
}

/// mpv reports `"error": "success"` on every successful reply.
fn reply_result(msg: Value) -> anyhow::Result<Value> {
    match msg.get("error").and_then(Value::as_str) {
        Some("success") => Ok(msg),
        Some(err) => Err(anyhow::anyhow!("mpv error: {}", err)),
        None => Err(anyhow::anyhow!("mpv reply without status")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn property_change_is_decoded() {
        let evt = MpvEvent {
            raw: json!({"event": "property-change", "id": OBS_CORE_IDLE, "name": "core-idle", "data": true}),
        };
        let (id, data) = evt.as_property_change().unwrap();
        assert_eq!(id, OBS_CORE_IDLE);
        assert_eq!(data, &json!(true));

        let end = MpvEvent {
            raw: json!({"event": "end-file", "reason": "error"}),
        };
        assert!(end.as_property_change().is_none());
        assert_eq!(end.event_name(), Some("end-file"));
        assert_eq!(end.end_reason(), Some("error"));
    }

    /// Replies are matched by request_id; unsolicited lines become events.
    #[tokio::test]
    async fn replies_and_events_are_routed() {
        let (client, server) = duplex(4096);
        let (client_read, client_write) = tokio::io::split(client);
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let handle = connect(client_read, client_write, event_tx);

        let (server_read, mut server_write) = tokio::io::split(server);
        let fake_mpv = tokio::spawn(async move {
            let mut lines = BufReader::new(server_read).lines();
            let line = lines.next_line().await.unwrap().unwrap();
            let req: Value = serde_json::from_str(&line).unwrap();
            assert_eq!(req["command"], json!(["set_property", "pause", true]));
            server_write
                .write_all(b"{\"event\":\"property-change\",\"id\":2,\"data\":true}\n")
                .await
                .unwrap();
            let reply = json!({"request_id": req["request_id"], "error": "success", "data": null});
            server_write
                .write_all(format!("{}\n", reply).as_bytes())
                .await
                .unwrap();
        });

        handle.set_pause(true).await.unwrap();
        let evt = event_rx.recv().await.unwrap();
        assert_eq!(evt.as_property_change().map(|(id, _)| id), Some(OBS_PAUSE));
        fake_mpv.await.unwrap();
    }

    #[tokio::test]
    async fn mpv_errors_fail_the_request() {
        let (client, server) = duplex(4096);
        let (client_read, client_write) = tokio::io::split(client);
        let (event_tx, _event_rx) = mpsc::channel(8);
        let handle = connect(client_read, client_write, event_tx);

        let (server_read, mut server_write) = tokio::io::split(server);
        tokio::spawn(async move {
            let mut lines = BufReader::new(server_read).lines();
            let line = lines.next_line().await.unwrap().unwrap();
            let req: Value = serde_json::from_str(&line).unwrap();
            let reply = json!({"request_id": req["request_id"], "error": "property unavailable"});
            server_write
                .write_all(format!("{}\n", reply).as_bytes())
                .await
                .unwrap();
        });

        let err = handle.seek_to_live_edge().await.unwrap_err();
        assert!(err.to_string().contains("property unavailable"));
    }

    #[tokio::test]
    async fn closed_socket_fails_waiting_requests() {
        let (client, server) = duplex(4096);
        let (client_read, client_write) = tokio::io::split(client);
        let (event_tx, _event_rx) = mpsc::channel(8);
        let handle = connect(client_read, client_write, event_tx);

        tokio::spawn(async move {
            let (server_read, _server_write) = tokio::io::split(server);
            let mut lines = BufReader::new(server_read).lines();
            // Read the request, then hang up without answering
            let _ = lines.next_line().await;
        });

        let err = handle.ping().await.unwrap_err();
        assert!(err.to_string().contains("connection closed"), "{}", err);
        assert!(handle.ping().await.is_err());
    }
}
