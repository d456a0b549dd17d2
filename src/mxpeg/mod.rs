//! MxPEG stream handling: the ring-buffer parser tape, the packet
//! demultiplexer, JPEG table helpers and the upstream camera client.
//!
//! MxPEG multiplexes JPEG video frames, JSON control events and PCM audio
//! over one TCP connection using JPEG APP markers.

pub mod client;
pub mod helpers;
pub mod packet_reader;
pub mod ring_buffer;

pub use client::{MxpegClient, StreamListener};
pub use packet_reader::{MxpegPacket, PacketReader};
pub use ring_buffer::RingBuffer;

use crate::error::MxpegResult;
use crate::stream::ByteSource;

/// JPEG / MxPEG marker bytes (the second byte of an `0xFF 0x??` marker).
pub mod markers {
    pub const SOI: u8 = 0xD8;
    pub const APP0: u8 = 0xE0;
    pub const COM: u8 = 0xFE;
    pub const DQT: u8 = 0xDB;
    pub const DHT: u8 = 0xC4;
    pub const SOF0: u8 = 0xC0;
    pub const SOS: u8 = 0xDA;
    pub const EOI: u8 = 0xD9;
    /// PCM audio packets.
    pub const APP11: u8 = 0xEB;
    /// JSON event packets.
    pub const APP12: u8 = 0xEC;
    /// A-law audio packets. Recognised but rejected.
    pub const APP13: u8 = 0xED;
}

/// Read one HTTP preamble line, consuming the CR/LF (or CRLF) terminator.
pub async fn read_line<S: ByteSource>(rb: &mut RingBuffer<S>) -> MxpegResult<String> {
    loop {
        let c = rb.next().await?;
        if c == 0x0d || c == 0x0a {
            break;
        }
    }

    rb.move_by(-1)?;
    let line = rb.get_and_cut().await?;

    rb.move_by(1)?;
    if rb.get().await? == 0x0a {
        rb.move_by(1)?;
    }
    rb.cut().await?;

    Ok(String::from_utf8_lossy(&line).into_owned())
}
