//! One downstream client session: HTTP preamble (or one-shot admin
//! webhook), then the bidirectional MxPEG client dialect with a keep-alive
//! ping timer.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::{value_as_bool, ServerHandle};
use crate::error::{MxpegError, MxpegResult};
use crate::mxpeg::{markers, read_line, RingBuffer};
use crate::stream::{Stream, StreamWriter};

const READ_TIMEOUT: Duration = Duration::from_secs(180);
const EVENT_BUFFER_SIZE: usize = 16 * 1024;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Accept a freshly-connected downstream client and run its session in a
/// new task.
pub(crate) fn handle_connection(
    parent: &CancellationToken,
    conn: TcpStream,
    peer: SocketAddr,
    server: ServerHandle,
    keep_alive: Duration,
) {
    let stream = Stream::new(parent, conn).with_read_timeout(READ_TIMEOUT);
    let id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);

    tokio::spawn(run(stream, id, peer, server, keep_alive));
}

async fn run(
    stream: Stream,
    id: u64,
    peer: SocketAddr,
    server: ServerHandle,
    keep_alive: Duration,
) {
    let writer = stream.writer();
    server.add_connection(id, peer, writer.clone());

    let ping_token = CancellationToken::new();
    let (activity_tx, activity_rx) = mpsc::unbounded_channel();
    tokio::spawn(keep_alive_loop(
        writer.clone(),
        keep_alive,
        activity_rx,
        ping_token.clone(),
    ));

    let rb = RingBuffer::new(EVENT_BUFFER_SIZE, stream);
    session(rb, &writer, id, peer, &server, activity_tx).await;

    ping_token.cancel();
    server.del_connection(id);
    writer.close();
    debug!(peer = %peer, "connection finished");
}

async fn session(
    mut rb: RingBuffer<Stream>,
    writer: &StreamWriter,
    id: u64,
    peer: SocketAddr,
    server: &ServerHandle,
    activity_tx: mpsc::UnboundedSender<()>,
) {
    match handle_http(&mut rb, server).await {
        Ok(false) => {}
        Ok(true) => {
            // one-shot admin webhook
            writer.write(&b"HTTP/1.1 200 OK\r\n\r\nCommand applied\r\n"[..]);
            debug!(peer = %peer, "webhook command applied");
            return;
        }
        Err(e) => {
            error!(peer = %peer, error = %e, "error reading http request headers");
            return;
        }
    }

    writer.write(&b"HTTP/1.1 200 OK\r\n\r\n"[..]);

    loop {
        let data = match read_event(&mut rb).await {
            Ok(data) => data,
            Err(e) => {
                error!(peer = %peer, error = %e, "error reading event");
                break;
            }
        };

        let _ = activity_tx.send(());

        if data.first() == Some(&0xff) {
            // audio-control packets are exactly 22 bytes with an 'S' at
            // offset 6; everything else 0xff-prefixed is audio data
            if data.len() == 22 && data[6] == 0x53 {
                if data[9] == 0x81 {
                    server.audio_start(id, data);
                } else {
                    server.audio_stop(id, data);
                }
            } else {
                server.audio_data(id, data);
            }
        } else {
            debug!(peer = %peer, evt = %String::from_utf8_lossy(&data), "got client event");

            let evt: Value = match serde_json::from_slice(&data) {
                Ok(evt) => evt,
                Err(e) => {
                    error!(peer = %peer, error = %e, "error unmarshal event");
                    break;
                }
            };

            handle_event(writer, server, id, &evt);
        }
    }
}

/// Consume the HTTP request preamble. Returns `true` when the request was
/// a `/bell` or `/nobell` admin webhook (already executed).
async fn handle_http(
    rb: &mut RingBuffer<Stream>,
    server: &ServerHandle,
) -> MxpegResult<bool> {
    let mut cmd_handled = false;

    loop {
        let line = read_line(rb).await?;
        if line.is_empty() {
            break;
        }

        if line.starts_with("GET ") || line.starts_with("POST ") {
            if let Some(cmd) = line.split_whitespace().nth(1) {
                match cmd {
                    "/bell" => {
                        cmd_handled = true;
                        server.send_bell(true);
                    }
                    "/nobell" => {
                        cmd_handled = true;
                        server.send_bell(false);
                    }
                    _ => {}
                }
            }
        }
    }

    Ok(cmd_handled)
}

/// Read one inbound packet: a complete `0xFF`-framed APP11 audio packet,
/// or a `0x0A 0x00`-terminated JSON line (returned without the trailer).
async fn read_event(rb: &mut RingBuffer<Stream>) -> MxpegResult<Vec<u8>> {
    if rb.get().await? == 0xff {
        rb.move_by(1)?;
        if rb.next().await? != markers::APP11 {
            return Err(MxpegError::Parse);
        }

        let l = ((rb.next().await? as isize) << 8) | rb.next().await? as isize;
        rb.move_by(l - 2)?;

        rb.get_and_cut().await
    } else {
        loop {
            if rb.next().await? == 0x0a {
                break;
            }
        }

        if rb.next().await? != 0x00 {
            return Err(MxpegError::Parse);
        }

        rb.move_by(-2)?;
        let data = rb.get_and_cut().await?;
        rb.move_by(2)?;
        rb.cut().await?;

        Ok(data)
    }
}

fn handle_event(writer: &StreamWriter, server: &ServerHandle, id: u64, evt: &Value) {
    let evt_id = evt.get("id").and_then(Value::as_i64).unwrap_or(0);
    let method = evt.get("method").and_then(Value::as_str).unwrap_or("");
    let params = evt.get("params");

    let mut result = json!(0);

    match method {
        "live" => server.enable_video(id),
        "list_addressees" => result = json!([[1, "MainBell", ""]]),
        "trigger" => server.open_door(id),
        "bell_ack" => {
            let is_ack = params
                .and_then(|p| p.get(0))
                .map(value_as_bool)
                .unwrap_or(false);
            if is_ack {
                server.bell_ack(id);
            } else {
                server.bell_reject(id);
            }
        }
        "suppress" => server.bell_suppress(id),
        "register_device" => server.register_bell(id, evt_id),
        "pong" => return,
        _ => {}
    }

    send_event(writer, &json!({ "result": result, "error": null, "id": evt_id }));
}

/// Frame a JSON event as an APP12 packet and queue it for sending.
pub(crate) fn send_event(writer: &StreamWriter, evt: &Value) {
    let b = match serde_json::to_vec(evt) {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, "error marshalling event");
            return;
        }
    };

    debug!(evt = %evt, "sending client event");

    let l = b.len() + 2;
    let mut data = Vec::with_capacity(l + 2);
    data.push(0xff);
    data.push(markers::APP12);
    data.push((l >> 8) as u8);
    data.push(l as u8);
    data.extend_from_slice(&b);

    writer.write(data);
}

/// Ring (or ring-end) notification, delivered only to clients that
/// registered a bell event id.
pub(crate) fn send_bell(writer: &StreamWriter, bell_evt_id: i64, is_ring: bool) {
    if bell_evt_id > 0 {
        send_event(
            writer,
            &json!({
                "result": ["bell", is_ring, !is_ring, [1, "Main Bell", ""]],
                "type": "cont",
                "error": null,
                "id": bell_evt_id,
            }),
        );
    }
}

/// Non-standard event understood only by the MoBell application.
pub(crate) fn send_suppress(writer: &StreamWriter, bell_evt_id: i64) {
    if bell_evt_id > 0 {
        send_event(
            writer,
            &json!({
                "result": ["suppress"],
                "type": "cont",
                "error": null,
                "id": bell_evt_id,
            }),
        );
    }
}

async fn keep_alive_loop(
    writer: StreamWriter,
    period: Duration,
    mut activity: mpsc::UnboundedReceiver<()>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            upd = activity.recv() => {
                if upd.is_none() {
                    return;
                }
                // inbound traffic: restart the countdown
            }
            _ = tokio::time::sleep(period) => {
                send_event(&writer, &json!({ "method": "ping" }));
            }
        }
    }
}
