//! Fan-out core of the proxy.
//!
//! All shared state — the connection set, the audio owner, the DQT/DHT
//! cache, the patch flag and the codec — lives inside one serializer task
//! that drains a command channel. I/O tasks never touch the state
//! directly; they post [`ServerEvent`]s and the serializer executes them
//! in order, which makes every mutation single-threaded without locks.

pub mod connection;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::{json, Value};
use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::{FrameCodec, KeyFrameCache};
use crate::mxpeg::helpers::{extract_dqt_dht, patch_dqt_dht};
use crate::mxpeg::{MxpegClient, StreamListener};
use crate::stream::StreamWriter;
use connection::{handle_connection, send_bell, send_suppress};

/// Canned audio-stop control packet, sent to the camera when the audio
/// owner disappears without stopping cleanly.
static AUDIO_STOP_EVT: [u8; 22] = [
    0xff, 0xeb, 0x00, 0x14, 0x4d, 0x58, 0x53, 0x00, 0x01, 0x01, 0x00, 0x00, 0x80, 0x3e, 0x00,
    0x00, 0x20, 0x50, 0x31, 0x36, 0x01, 0x01,
];

pub struct ServerConfig {
    pub listen_addr: String,
    pub mobotix_addr: String,
    pub mobotix_user: String,
    pub mobotix_pass: String,
    /// MAC address of this host, used as the camera-side device identity.
    pub mac: String,
    /// Delay between keep-alive pings to idle downstream clients.
    pub keep_alive: Duration,
}

pub struct Server {
    listen_addr: String,
    mac: String,
    keep_alive: Duration,

    token: CancellationToken,
    handle: ServerHandle,
    events: Option<mpsc::UnboundedReceiver<ServerEvent>>,
    client: Arc<MxpegClient>,
    local_addr: Option<SocketAddr>,

    tasks: Vec<JoinHandle<()>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let token = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ServerHandle { tx };

        let client = MxpegClient::new(
            config.mobotix_addr,
            config.mobotix_user,
            config.mobotix_pass,
            token.child_token(),
            Arc::new(UpstreamBridge {
                handle: handle.clone(),
            }),
        );

        Self {
            listen_addr: config.listen_addr,
            mac: config.mac,
            keep_alive: config.keep_alive,
            token,
            handle,
            events: Some(rx),
            client,
            local_addr: None,
            tasks: Vec::new(),
        }
    }

    pub async fn start(&mut self) -> io::Result<()> {
        let Some(events) = self.events.take() else {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "server already started",
            ));
        };

        let listener = TcpListener::bind(&self.listen_addr).await?;
        self.local_addr = Some(listener.local_addr()?);
        info!(addr = %self.listen_addr, "listening for client connections");

        let state = ServerState {
            client: self.client.clone(),
            handle: self.handle.clone(),
            mac: self.mac.clone(),
            codec: Box::new(KeyFrameCache::new()),
            conns: Vec::new(),
            audio_owner: None,
            dqt: None,
            dht: None,
            patch_dxt: false,
        };
        let token = self.token.clone();
        self.tasks
            .push(tokio::spawn(async move { state.run(events, token).await }));

        self.tasks.push(self.client.start());

        let token = self.token.clone();
        let handle = self.handle.clone();
        let keep_alive = self.keep_alive;
        self.tasks.push(tokio::spawn(async move {
            loop {
                let (conn, peer) = tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "error accepting connection");
                            break;
                        }
                    },
                };

                debug!(peer = %peer, "connection accepted");
                set_keepalive(&conn);
                handle_connection(&token, conn, peer, handle.clone(), keep_alive);
            }
            debug!("finished accepting new connections");
        }));

        Ok(())
    }

    /// Cancel everything and wait for the serializer, the camera client and
    /// the accept loop to finish.
    pub async fn stop(&mut self) {
        info!("stopping server");
        self.token.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        info!("stopped");
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Actual bound listen address; `None` before [`start`](Self::start).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

/// Best-effort TCP keepalive tuning for downstream sockets.
fn set_keepalive(conn: &TcpStream) {
    let ka = TcpKeepalive::new()
        .with_time(Duration::from_secs(120))
        .with_interval(Duration::from_secs(5))
        .with_retries(3);

    if let Err(e) = SockRef::from(conn).set_tcp_keepalive(&ka) {
        warn!(error = %e, "can't set keepalive parameters");
    }
}

/// Commands executed by the serializer task, in posting order.
pub(crate) enum ServerEvent {
    AddConnection {
        id: u64,
        peer: SocketAddr,
        writer: StreamWriter,
    },
    DelConnection { id: u64 },
    EnableVideo { id: u64 },
    AudioStart { id: u64, data: Vec<u8> },
    AudioStop { id: u64, data: Vec<u8> },
    AudioData { id: u64, data: Vec<u8> },
    RegisterBell { id: u64, evt_id: i64 },
    SendBell { is_ring: bool },
    BellAck { id: u64 },
    BellReject { id: u64 },
    BellSuppress { id: u64 },
    OpenDoor { id: u64 },
    StreamStart,
    StreamStop,
    Video { data: Bytes },
    Audio { data: Bytes },
}

/// Cloneable posting side of the serializer channel. Sends never block;
/// posting to a stopped server drops the command.
#[derive(Clone)]
pub(crate) struct ServerHandle {
    tx: mpsc::UnboundedSender<ServerEvent>,
}

impl ServerHandle {
    fn send(&self, evt: ServerEvent) {
        let _ = self.tx.send(evt);
    }

    pub fn add_connection(&self, id: u64, peer: SocketAddr, writer: StreamWriter) {
        self.send(ServerEvent::AddConnection { id, peer, writer });
    }

    pub fn del_connection(&self, id: u64) {
        self.send(ServerEvent::DelConnection { id });
    }

    pub fn enable_video(&self, id: u64) {
        self.send(ServerEvent::EnableVideo { id });
    }

    pub fn audio_start(&self, id: u64, data: Vec<u8>) {
        self.send(ServerEvent::AudioStart { id, data });
    }

    pub fn audio_stop(&self, id: u64, data: Vec<u8>) {
        self.send(ServerEvent::AudioStop { id, data });
    }

    pub fn audio_data(&self, id: u64, data: Vec<u8>) {
        self.send(ServerEvent::AudioData { id, data });
    }

    pub fn register_bell(&self, id: u64, evt_id: i64) {
        self.send(ServerEvent::RegisterBell { id, evt_id });
    }

    pub fn send_bell(&self, is_ring: bool) {
        self.send(ServerEvent::SendBell { is_ring });
    }

    pub fn bell_ack(&self, id: u64) {
        self.send(ServerEvent::BellAck { id });
    }

    pub fn bell_reject(&self, id: u64) {
        self.send(ServerEvent::BellReject { id });
    }

    pub fn bell_suppress(&self, id: u64) {
        self.send(ServerEvent::BellSuppress { id });
    }

    pub fn open_door(&self, id: u64) {
        self.send(ServerEvent::OpenDoor { id });
    }
}

/// Forwards upstream stream callbacks into the serializer channel.
struct UpstreamBridge {
    handle: ServerHandle,
}

impl StreamListener for UpstreamBridge {
    fn on_stream_start(&self) {
        self.handle.send(ServerEvent::StreamStart);
    }

    fn on_stream_stop(&self) {
        self.handle.send(ServerEvent::StreamStop);
    }

    fn on_video(&self, data: Bytes, _key_frame: bool) {
        self.handle.send(ServerEvent::Video { data });
    }

    fn on_audio(&self, data: Bytes) {
        self.handle.send(ServerEvent::Audio { data });
    }
}

struct ConnEntry {
    id: u64,
    peer: SocketAddr,
    writer: StreamWriter,
    video_enabled: bool,
    bell_evt_id: i64,
}

/// State owned exclusively by the serializer task.
struct ServerState {
    client: Arc<MxpegClient>,
    handle: ServerHandle,
    mac: String,

    codec: Box<dyn FrameCodec>,

    /// Live downstream connections, in accept order.
    conns: Vec<ConnEntry>,
    /// The one connection allowed to send audio upstream.
    audio_owner: Option<u64>,

    dqt: Option<Vec<u8>>,
    dht: Option<Vec<u8>>,
    patch_dxt: bool,
}

impl ServerState {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<ServerEvent>,
        token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                evt = events.recv() => match evt {
                    Some(evt) => self.handle_event(evt),
                    None => break,
                },
            }
        }
        debug!("server finished run");
    }

    fn handle_event(&mut self, evt: ServerEvent) {
        match evt {
            ServerEvent::AddConnection { id, peer, writer } => {
                self.conns.push(ConnEntry {
                    id,
                    peer,
                    writer,
                    video_enabled: false,
                    bell_evt_id: 0,
                });
            }
            ServerEvent::DelConnection { id } => {
                self.conns.retain(|c| c.id != id);

                if self.audio_owner == Some(id) {
                    self.audio_owner = None;
                    // stop command was not sent by the connection itself
                    self.client.write(Bytes::from_static(&AUDIO_STOP_EVT));
                }
            }
            ServerEvent::EnableVideo { id } => {
                if let Some(conn) = self.conns.iter_mut().find(|c| c.id == id) {
                    if !conn.video_enabled {
                        debug!(peer = %conn.peer, "video enabled");
                        conn.video_enabled = true;
                        if let Some(frame) = self.codec.encode_frame() {
                            conn.writer.write(frame);
                        }
                    }
                }

                self.patch_dxt = true;
            }
            ServerEvent::AudioStart { id, data } => {
                if self.audio_owner.is_none() {
                    debug!("audio recording started");
                    self.audio_owner = Some(id);
                    self.client.write(data.into());
                } else {
                    debug!("can't start audio recording - busy with another connection");
                }
            }
            ServerEvent::AudioStop { id, data } => {
                if self.audio_owner == Some(id) {
                    debug!("audio recording stopped");
                    self.audio_owner = None;
                    self.client.write(data.into());
                } else {
                    debug!("can't stop audio recording - busy with another connection");
                }
            }
            ServerEvent::AudioData { id, data } => {
                if self.audio_owner == Some(id) {
                    self.client.write(data.into());
                }
            }
            ServerEvent::RegisterBell { id, evt_id } => {
                if let Some(conn) = self.conns.iter_mut().find(|c| c.id == id) {
                    conn.bell_evt_id = evt_id;
                }
            }
            ServerEvent::SendBell { is_ring } => self.send_bell(is_ring),
            ServerEvent::BellAck { id } => self.bell_resp(id, "bell_ack", json!([true])),
            ServerEvent::BellReject { id } => self.bell_resp(id, "bell_ack", json!([false])),
            ServerEvent::OpenDoor { id } => self.bell_resp(id, "trigger", json!(["door"])),
            ServerEvent::BellSuppress { id } => {
                self.notify_others(id, |c| send_suppress(&c.writer, c.bell_evt_id));
            }
            ServerEvent::StreamStart => self.on_stream_start(),
            ServerEvent::StreamStop => self.codec.on_stream_stop(),
            ServerEvent::Video { data } => self.on_video(data),
            ServerEvent::Audio { data } => self.broadcast(&data),
        }
    }

    /// Camera session established: configure the stream and walk the
    /// device-registration chain that ends with a permanent bell listener.
    fn on_stream_start(&mut self) {
        self.codec.on_stream_start();

        let c = &self.client;
        c.send_cmd_silent("mode", Some(json!(["mxpeg"])));
        c.send_cmd_silent("audiooutput", Some(json!(["pcm16"])));
        c.send_cmd_silent("live", Some(json!([false])));

        let client = self.client.clone();
        let handle = self.handle.clone();
        let mac = self.mac.clone();

        c.send_cmd(
            "list_addressees",
            None,
            Some(Box::new(move |evt| {
                let dev_id = evt
                    .pointer("/result/0/0")
                    .and_then(Value::as_i64)
                    .unwrap_or(0);

                let client2 = client.clone();
                let handle2 = handle.clone();
                let mac2 = mac.clone();

                client.send_cmd(
                    "add_device",
                    Some(json!([mac.as_str(), [dev_id], format!("MoBell+{mac}")])),
                    Some(Box::new(move |_| {
                        let handle3 = handle2.clone();
                        client2.send_cmd(
                            "register_device",
                            Some(json!([mac2.as_str()])),
                            Some(Box::new(move |evt| on_bell(&handle3, evt))),
                        );
                        true
                    })),
                );
                true
            })),
        );
    }

    fn on_video(&mut self, data: Bytes) {
        if !self.codec.on_video_packet(&data) {
            error!("error decoding video frame");
            self.client.reconnect();
            return;
        }

        // remember the tables from the original stream; motion frames get
        // patched with them right after key frame generation
        let (dqt, dht) = extract_dqt_dht(&data);
        if let Some(dqt) = dqt {
            self.dqt = Some(dqt);
        }
        if let Some(dht) = dht {
            self.dht = Some(dht);
        }

        let data = if self.patch_dxt {
            self.patch_dxt = false;
            Bytes::from(patch_dqt_dht(&data, self.dqt.as_deref(), self.dht.as_deref()))
        } else {
            data
        };

        self.broadcast(&data);
    }

    fn broadcast(&self, data: &Bytes) {
        for conn in &self.conns {
            if conn.video_enabled {
                conn.writer.write(data.clone());
            }
        }
    }

    fn send_bell(&self, is_ring: bool) {
        for conn in &self.conns {
            send_bell(&conn.writer, conn.bell_evt_id, is_ring);
        }
    }

    /// Forward a bell response upstream and stop ringing everyone else.
    fn bell_resp(&self, id: u64, method: &str, params: Value) {
        self.client.send_cmd_silent(method, Some(params));
        self.notify_others(id, |c| send_bell(&c.writer, c.bell_evt_id, false));
    }

    fn notify_others(&self, id: u64, action: impl Fn(&ConnEntry)) {
        for conn in self.conns.iter().filter(|c| c.id != id) {
            action(conn);
        }
    }
}

/// Permanent `register_device` handler: every `["bell", ringing, ..]`
/// result fans out to the registered clients. Always returns `false` so it
/// survives across bell events.
fn on_bell(handle: &ServerHandle, evt: &Value) -> bool {
    let result = evt.get("result");

    if result.and_then(|r| r.get(0)).and_then(Value::as_str) == Some("bell") {
        let is_ring = result
            .and_then(|r| r.get(1))
            .map(value_as_bool)
            .unwrap_or(false);

        debug!(ringing = is_ring, "received bell");
        handle.send_bell(is_ring);
    }

    false
}

/// Loose boolean reading: accepts JSON `true` and the string `"true"`.
pub(crate) fn value_as_bool(v: &Value) -> bool {
    v.as_bool()
        .unwrap_or_else(|| v.as_str() == Some("true"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::Stream;
    use tokio::io::AsyncReadExt;
    use tokio::net::tcp::OwnedReadHalf;
    use tokio::net::TcpListener;

    /// A real socket pair whose proxy side is wrapped in a `Stream`, so
    /// state-level tests can observe what the server writes.
    async fn test_conn(token: &CancellationToken) -> (OwnedReadHalf, StreamWriter) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (server_side, _) = listener.accept().await.unwrap();

        let stream = Stream::new(token, server_side);
        let writer = stream.writer();
        drop(stream);

        let (reader, _) = client.into_split();
        (reader, writer)
    }

    fn new_state(token: &CancellationToken) -> ServerState {
        struct NullListener;

        impl StreamListener for NullListener {
            fn on_stream_start(&self) {}
            fn on_stream_stop(&self) {}
            fn on_video(&self, _data: Bytes, _key_frame: bool) {}
            fn on_audio(&self, _data: Bytes) {}
        }

        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = ServerHandle { tx };
        let client = MxpegClient::new(
            "127.0.0.1:9".into(),
            String::new(),
            String::new(),
            token.child_token(),
            Arc::new(NullListener),
        );

        ServerState {
            client,
            handle,
            mac: "00:11:22:33:44:55".into(),
            codec: Box::new(KeyFrameCache::new()),
            conns: Vec::new(),
            audio_owner: None,
            dqt: None,
            dht: None,
            patch_dxt: false,
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    async fn read_some(reader: &mut OwnedReadHalf) -> Vec<u8> {
        let mut buf = vec![0u8; 4096];
        let n = tokio::time::timeout(Duration::from_secs(2), reader.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        buf.truncate(n);
        buf
    }

    async fn assert_silent(reader: &mut OwnedReadHalf) {
        let silent = tokio::time::timeout(Duration::from_millis(200), async {
            let mut buf = [0u8; 1];
            reader.read(&mut buf).await
        })
        .await;
        assert!(silent.is_err());
    }

    #[tokio::test]
    async fn audio_owner_is_exclusive() {
        let token = CancellationToken::new();
        let mut state = new_state(&token);

        let (_a, a_writer) = test_conn(&token).await;
        let (_b, b_writer) = test_conn(&token).await;
        state.handle_event(ServerEvent::AddConnection { id: 1, peer: peer(), writer: a_writer });
        state.handle_event(ServerEvent::AddConnection { id: 2, peer: peer(), writer: b_writer });

        state.handle_event(ServerEvent::AudioStart { id: 1, data: vec![0xff; 22] });
        assert_eq!(state.audio_owner, Some(1));

        // a second claimant is rejected
        state.handle_event(ServerEvent::AudioStart { id: 2, data: vec![0xff; 22] });
        assert_eq!(state.audio_owner, Some(1));

        // only the owner can stop
        state.handle_event(ServerEvent::AudioStop { id: 2, data: vec![0xff; 22] });
        assert_eq!(state.audio_owner, Some(1));
        state.handle_event(ServerEvent::AudioStop { id: 1, data: vec![0xff; 22] });
        assert_eq!(state.audio_owner, None);
    }

    #[tokio::test]
    async fn dropping_the_audio_owner_clears_ownership() {
        let token = CancellationToken::new();
        let mut state = new_state(&token);

        let (_a, a_writer) = test_conn(&token).await;
        state.handle_event(ServerEvent::AddConnection { id: 1, peer: peer(), writer: a_writer });
        state.handle_event(ServerEvent::AudioStart { id: 1, data: vec![0xff; 22] });

        state.handle_event(ServerEvent::DelConnection { id: 1 });
        assert_eq!(state.audio_owner, None);
        assert!(state.conns.is_empty());
    }

    #[tokio::test]
    async fn bell_fans_out_only_to_registered_connections() {
        let token = CancellationToken::new();
        let mut state = new_state(&token);

        let (mut a, a_writer) = test_conn(&token).await;
        let (mut b, b_writer) = test_conn(&token).await;
        state.handle_event(ServerEvent::AddConnection { id: 1, peer: peer(), writer: a_writer });
        state.handle_event(ServerEvent::AddConnection { id: 2, peer: peer(), writer: b_writer });
        state.handle_event(ServerEvent::RegisterBell { id: 1, evt_id: 42 });

        state.handle_event(ServerEvent::SendBell { is_ring: true });

        let frame = read_some(&mut a).await;
        assert_eq!(&frame[..2], &[0xff, 0xec]);
        let evt: Value = serde_json::from_slice(&frame[4..]).unwrap();
        assert_eq!(evt["id"], 42);
        assert_eq!(evt["result"][0], "bell");
        assert_eq!(evt["result"][1], true);
        assert_eq!(evt["result"][2], false);

        // the unregistered connection stays silent
        assert_silent(&mut b).await;
    }

    #[tokio::test]
    async fn video_broadcast_reaches_only_enabled_viewers() {
        let token = CancellationToken::new();
        let mut state = new_state(&token);

        let (mut a, a_writer) = test_conn(&token).await;
        let (mut b, b_writer) = test_conn(&token).await;
        state.handle_event(ServerEvent::AddConnection { id: 1, peer: peer(), writer: a_writer });
        state.handle_event(ServerEvent::AddConnection { id: 2, peer: peer(), writer: b_writer });
        state.handle_event(ServerEvent::EnableVideo { id: 1 });
        assert!(state.patch_dxt);

        let frame = vec![0xff, 0xd8, 0xff, 0xd9];
        state.handle_event(ServerEvent::Video { data: Bytes::from(frame.clone()) });

        let got = read_some(&mut a).await;
        assert_eq!(got, frame);

        assert_silent(&mut b).await;
    }

    #[test]
    fn loose_boolean_reading() {
        assert!(value_as_bool(&json!(true)));
        assert!(value_as_bool(&json!("true")));
        assert!(!value_as_bool(&json!(false)));
        assert!(!value_as_bool(&json!("yes")));
        assert!(!value_as_bool(&json!(null)));
        assert!(!value_as_bool(&json!(1)));
    }
}
