//! Long-lived client connection to the Mobotix camera.
//!
//! A supervisor task keeps one upstream connection alive: dial, HTTP
//! handshake with Basic auth, then the MxPEG packet loop until the
//! connection dies, then wait and redial. Commands are correlated with
//! their responses by packet id through a concurrent pending-request table.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::packet_reader::{MxpegPacket, PacketReader};
use super::read_line;
use super::ring_buffer::RingBuffer;
use crate::error::{MxpegError, MxpegResult};
use crate::stream::{ByteSource, Stream, StreamWriter};

// 4 mb should be enough for any frame
const RING_BUFFER_SIZE: usize = 4 * 1024 * 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// First packet id of a session; reset on every reconnect.
const INITIAL_PACKET_ID: u32 = 10;

/// Response handler registered with [`MxpegClient::send_cmd`]. Returning
/// `true` marks the response as final and unregisters the handler.
pub type EventHandler = Box<dyn FnMut(&Value) -> bool + Send + Sync>;

/// Stream lifecycle and media callbacks, delivered from the client's
/// reader task.
pub trait StreamListener: Send + Sync {
    fn on_stream_start(&self);
    fn on_stream_stop(&self);
    fn on_video(&self, data: Bytes, key_frame: bool);
    fn on_audio(&self, data: Bytes);
}

pub struct MxpegClient {
    mobotix_addr: String,
    mobotix_user: String,
    mobotix_pass: String,

    token: CancellationToken,
    listener: Arc<dyn StreamListener>,

    /// The currently-published upstream stream; `None` between sessions.
    /// Writers read the handle and drop the data when there is none.
    stream: Mutex<Option<StreamWriter>>,

    packet_id: AtomicU32,
    pending: DashMap<u32, EventHandler>,
}

impl MxpegClient {
    pub fn new(
        mobotix_addr: String,
        mobotix_user: String,
        mobotix_pass: String,
        token: CancellationToken,
        listener: Arc<dyn StreamListener>,
    ) -> Arc<Self> {
        Arc::new(Self {
            mobotix_addr,
            mobotix_user,
            mobotix_pass,
            token,
            listener,
            stream: Mutex::new(None),
            packet_id: AtomicU32::new(INITIAL_PACKET_ID),
            pending: DashMap::new(),
        })
    }

    /// Start the supervisor task. It runs until the client's token is
    /// cancelled.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        debug!("starting camera client");
        let client = self.clone();
        tokio::spawn(async move { client.run().await })
    }

    /// Close the currently-published stream, forcing the supervisor through
    /// another connect cycle.
    pub fn reconnect(&self) {
        debug!("requesting camera reconnect");

        if let Some(w) = self.stream.lock().as_ref() {
            w.close();
        }
    }

    async fn run(&self) {
        loop {
            if self.token.is_cancelled() {
                break;
            }

            debug!("connecting to mobotix");
            self.run_once().await;
            debug!("connection terminated");

            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
        }

        debug!("camera client finished");
    }

    async fn run_once(&self) {
        let conn = match Stream::connect(&self.token, &self.mobotix_addr, CONNECT_TIMEOUT).await
        {
            Ok(conn) => conn,
            Err(e) => {
                error!(error = %e, "error connecting to host");
                return;
            }
        };

        let writer = conn.writer();
        let mut rb = RingBuffer::new(RING_BUFFER_SIZE, conn);

        let host = self
            .mobotix_addr
            .split(':')
            .next()
            .unwrap_or(&self.mobotix_addr);
        let auth = BASE64.encode(format!("{}:{}", self.mobotix_user, self.mobotix_pass));

        writer.write(
            format!(
                "POST /control/eventstream.jpg HTTP/1.1\r\nHost: {host}\r\nAuthorization: Basic {auth}\r\n\r\n",
            )
            .into_bytes(),
        );

        let status = match read_status(&mut rb).await {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %e, "error connecting");
                writer.close();
                return;
            }
        };
        if status != 200 {
            warn!(status, "error connecting");
            writer.close();
            return;
        }

        // fresh session: reset packet ids and drop stale handlers
        self.packet_id.store(INITIAL_PACKET_ID, Ordering::SeqCst);
        self.pending.clear();

        *self.stream.lock() = Some(writer.clone());
        self.listener.on_stream_start();

        let mut reader = PacketReader::new(rb);
        loop {
            match reader.read_packet().await {
                Ok(MxpegPacket::Video { data, key_frame }) => {
                    self.listener.on_video(data.into(), key_frame);
                }
                Ok(MxpegPacket::Audio(data)) => self.listener.on_audio(data.into()),
                Ok(MxpegPacket::Event(evt)) => self.dispatch_event(&evt),
                Err(e) => {
                    warn!(error = %e, "error reading packet");
                    break;
                }
            }
        }

        self.listener.on_stream_stop();
        *self.stream.lock() = None;
        writer.close();
    }

    /// Write raw bytes to the upstream stream; dropped when no stream is
    /// published.
    pub fn write(&self, data: Bytes) {
        if let Some(w) = self.stream.lock().as_ref() {
            w.write(data);
        }
    }

    fn write_cmd(&self, mut cmd: Vec<u8>) {
        cmd.push(0x0a);
        cmd.push(0x00);
        self.write(cmd.into());
    }

    pub fn send_cmd_silent(&self, method: &str, params: Option<Value>) {
        self.send_cmd(method, params, None);
    }

    /// Send a JSON command upstream. A provided handler is invoked for every
    /// response carrying this command's packet id until it returns `true`.
    pub fn send_cmd(&self, method: &str, params: Option<Value>, handler: Option<EventHandler>) {
        let id = self.packet_id.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some(handler) = handler {
            self.pending.insert(id, handler);
        }

        let mut evt = json!({ "id": id, "method": method });
        if let Some(params) = params {
            evt["params"] = params;
        }

        match serde_json::to_vec(&evt) {
            Ok(cmd) => {
                debug!(cmd = %evt, "sending");
                self.write_cmd(cmd);
            }
            Err(_) => error!("fatal error on marshalling event"),
        }
    }

    /// Route an upstream event to its pending handler, if any. Events
    /// without an id, or with an id nobody is waiting on, are dropped.
    fn dispatch_event(&self, evt: &Value) {
        let Some(id) = evt.get("id").and_then(Value::as_u64) else {
            return;
        };

        // The handler is taken out of the table for the duration of the
        // call; it may itself register new commands.
        let Some((id, mut handler)) = self.pending.remove(&(id as u32)) else {
            return;
        };

        if !handler(evt) {
            self.pending.insert(id, handler);
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Consume the HTTP response preamble and return the status code (the
/// second whitespace-separated token of the status line).
async fn read_status<S: ByteSource>(rb: &mut RingBuffer<S>) -> MxpegResult<u16> {
    let line = read_line(rb).await?;

    let mut fields = line.split_whitespace();
    let _version = fields.next();
    let status = fields
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or(MxpegError::Parse)?;

    loop {
        if read_line(rb).await?.is_empty() {
            break;
        }
    }

    Ok(status)
}
