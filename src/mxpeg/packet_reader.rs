//! Demultiplexes the upstream MxPEG byte stream into packets.
//!
//! One call to [`PacketReader::read_packet`] yields one packet: a JPEG
//! video frame, a PCM audio fragment or a JSON event. The stream is lossy
//! by design, so every packet starts with a resynchronisation scan to the
//! next `0xFF` marker byte.

use serde_json::Value;
use tracing::debug;

use super::markers;
use super::ring_buffer::RingBuffer;
use crate::error::{MxpegError, MxpegResult};
use crate::stream::ByteSource;

/// One demultiplexed packet, in upstream receipt order.
#[derive(Debug)]
pub enum MxpegPacket {
    /// A complete JPEG marker sequence `FF D8 .. FF D9`. `key_frame` is set
    /// when the frame carries an SOF0 segment (and therefore its own
    /// quantisation and Huffman tables).
    Video { data: Vec<u8>, key_frame: bool },
    /// Raw PCM16 audio, still wrapped in its APP11 framing.
    Audio(Vec<u8>),
    /// A decoded JSON control event.
    Event(Value),
}

pub struct PacketReader<S> {
    rb: RingBuffer<S>,
}

impl<S: ByteSource> PacketReader<S> {
    pub fn new(rb: RingBuffer<S>) -> Self {
        Self { rb }
    }

    /// Extract the next packet from the stream. Unsupported APP11 audio
    /// subtypes are discarded and the scan continues with the following
    /// packet; A-law audio (APP13) is rejected.
    pub async fn read_packet(&mut self) -> MxpegResult<MxpegPacket> {
        loop {
            // skip garbage up to the next marker, keeping the 0xff byte
            while self.rb.next().await? != 0xff {}
            self.rb.cut_with_step(-1).await?;

            match self.rb.next().await? {
                markers::SOI => return self.read_video().await,
                markers::APP11 => {
                    if let Some(pcm) = self.read_audio_pcm().await? {
                        return Ok(MxpegPacket::Audio(pcm));
                    }
                }
                markers::APP12 => return self.read_event().await,
                // alaw packets are not really supported by clients
                markers::APP13 => return Err(MxpegError::Parse),
                _ => return Err(MxpegError::Parse),
            }
        }
    }

    async fn read_video(&mut self) -> MxpegResult<MxpegPacket> {
        let rb = &mut self.rb;
        let mut key_frame = false;

        loop {
            while rb.next().await? != 0xff {}

            let mut marker = rb.next().await?;

            if marker == markers::EOI {
                break;
            }

            if !matches!(
                marker,
                markers::SOF0
                    | markers::SOS
                    | markers::APP0
                    | markers::COM
                    | markers::DQT
                    | markers::DHT
            ) {
                return Err(MxpegError::Parse);
            }

            if marker == markers::SOF0 {
                key_frame = true;
            }

            let l = ((rb.next().await? as usize) << 8) | rb.next().await? as usize;
            rb.move_by(l as isize - 2)?;

            if marker == markers::SOS {
                // entropy-coded data: 0xff is escaped as 0xff 0x00
                loop {
                    while rb.next().await? != 0xff {}

                    marker = rb.next().await?;
                    if marker != 0 {
                        rb.move_by(-2)?;
                        break;
                    }
                }
            }
        }

        Ok(MxpegPacket::Video {
            data: rb.get_and_cut().await?,
            key_frame,
        })
    }

    /// APP11 payload is `'M' 'X' <subtype> <samples>`; only subtype `'A'`
    /// (pcm16) is delivered. The packet keeps its framing so it can be
    /// forwarded verbatim.
    async fn read_audio_pcm(&mut self) -> MxpegResult<Option<Vec<u8>>> {
        let rb = &mut self.rb;

        let l = ((rb.next().await? as usize) << 8) | rb.next().await? as usize;

        if rb.next().await? != b'M' {
            return Err(MxpegError::Parse);
        }
        if rb.next().await? != b'X' {
            return Err(MxpegError::Parse);
        }

        let t = rb.next().await?;

        rb.move_by(l as isize - 2 - 3)?;

        if t == b'A' {
            Ok(Some(rb.get_and_cut().await?))
        } else {
            rb.cut().await?;
            Ok(None)
        }
    }

    async fn read_event(&mut self) -> MxpegResult<MxpegPacket> {
        let rb = &mut self.rb;

        let l = ((rb.next().await? as usize) << 8) | rb.next().await? as usize;

        rb.cut().await?;
        rb.move_by(l as isize - 2)?;

        let mut v = rb.get_and_cut().await?;
        if v.last() == Some(&0) {
            v.pop();
        }

        debug!(event = %String::from_utf8_lossy(&v), "received event");

        let evt: Value = serde_json::from_slice(&v)?;
        Ok(MxpegPacket::Event(evt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn reader(data: Vec<u8>) -> PacketReader<Cursor<Vec<u8>>> {
        PacketReader::new(RingBuffer::new(64 * 1024, Cursor::new(data)))
    }

    fn seg(marker: u8, payload: &[u8]) -> Vec<u8> {
        let l = payload.len() + 2;
        let mut s = vec![0xff, marker, (l >> 8) as u8, l as u8];
        s.extend_from_slice(payload);
        s
    }

    fn video_frame(with_sof0: bool) -> Vec<u8> {
        let mut f = vec![0xff, markers::SOI];
        f.extend_from_slice(&seg(markers::APP0, &[b'J', b'F', b'I', b'F', 0]));
        if with_sof0 {
            f.extend_from_slice(&seg(markers::DQT, &[0; 5]));
            f.extend_from_slice(&seg(markers::DHT, &[0; 3]));
            f.extend_from_slice(&seg(markers::SOF0, &[8, 0, 16, 0, 16, 1]));
        }
        f.extend_from_slice(&seg(markers::SOS, &[1, 0, 0]));
        f.extend_from_slice(&[0x12, 0x34, 0xff, 0x00, 0x56]);
        f.extend_from_slice(&[0xff, markers::EOI]);
        f
    }

    fn event_packet(json: &str, pad: bool) -> Vec<u8> {
        let mut b = json.as_bytes().to_vec();
        if pad {
            b.push(0);
        }
        let l = b.len() + 2;
        let mut p = vec![0xff, markers::APP12, (l >> 8) as u8, l as u8];
        p.extend_from_slice(&b);
        p
    }

    fn pcm_packet(subtype: u8, samples: &[u8]) -> Vec<u8> {
        let l = samples.len() + 3 + 2;
        let mut p = vec![0xff, markers::APP11, (l >> 8) as u8, l as u8];
        p.extend_from_slice(&[b'M', b'X', subtype]);
        p.extend_from_slice(samples);
        p
    }

    #[tokio::test]
    async fn reads_key_frame() {
        let frame = video_frame(true);
        let mut r = reader(frame.clone());

        match r.read_packet().await.unwrap() {
            MxpegPacket::Video { data, key_frame } => {
                assert!(key_frame);
                assert_eq!(data, frame);
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[tokio::test]
    async fn motion_frame_is_not_key_frame() {
        let mut r = reader(video_frame(false));

        match r.read_packet().await.unwrap() {
            MxpegPacket::Video { key_frame, .. } => assert!(!key_frame),
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[tokio::test]
    async fn skips_garbage_before_packet() {
        let mut data = vec![0x00, 0x11, 0x22];
        let frame = video_frame(false);
        data.extend_from_slice(&frame);
        let mut r = reader(data);

        match r.read_packet().await.unwrap() {
            MxpegPacket::Video { data, .. } => assert_eq!(data, frame),
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[tokio::test]
    async fn decodes_event_packet() {
        let mut r = reader(event_packet(r#"{"id":3,"method":"ping"}"#, true));

        match r.read_packet().await.unwrap() {
            MxpegPacket::Event(evt) => {
                assert_eq!(evt["id"], 3);
                assert_eq!(evt["method"], "ping");
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[tokio::test]
    async fn event_without_padding_decodes_too() {
        let mut r = reader(event_packet(r#"{"id":4}"#, false));

        match r.read_packet().await.unwrap() {
            MxpegPacket::Event(evt) => assert_eq!(evt["id"], 4),
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_event_json_is_an_error() {
        let mut r = reader(event_packet("{nope", false));
        assert!(matches!(
            r.read_packet().await,
            Err(MxpegError::Json(_))
        ));
    }

    #[tokio::test]
    async fn delivers_pcm_audio_with_framing() {
        let packet = pcm_packet(b'A', &[1, 2, 3, 4]);
        let mut r = reader(packet.clone());

        match r.read_packet().await.unwrap() {
            MxpegPacket::Audio(data) => assert_eq!(data, packet),
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[tokio::test]
    async fn discards_unknown_audio_subtype() {
        // An unknown subtype packet followed by a video frame: the reader
        // silently drops the former and returns the latter.
        let mut data = pcm_packet(b'Q', &[1, 2]);
        data.extend_from_slice(&video_frame(false));
        let mut r = reader(data);

        assert!(matches!(
            r.read_packet().await.unwrap(),
            MxpegPacket::Video { .. }
        ));
    }

    #[tokio::test]
    async fn rejects_alaw_audio() {
        let mut r = reader(vec![0xff, markers::APP13, 0x00, 0x10]);
        assert!(matches!(r.read_packet().await, Err(MxpegError::Parse)));
    }

    #[tokio::test]
    async fn rejects_unexpected_marker() {
        let mut r = reader(vec![0xff, 0x99]);
        assert!(matches!(r.read_packet().await, Err(MxpegError::Parse)));
    }

    #[tokio::test]
    async fn rejects_illegal_marker_inside_video() {
        let mut data = vec![0xff, markers::SOI];
        data.extend_from_slice(&seg(0xC2, &[0; 4]));
        let mut r = reader(data);
        assert!(matches!(r.read_packet().await, Err(MxpegError::Parse)));
    }

    #[tokio::test]
    async fn reads_interleaved_packet_sequence() {
        let mut data = video_frame(true);
        data.extend_from_slice(&pcm_packet(b'A', &[9, 9]));
        data.extend_from_slice(&event_packet(r#"{"id":1}"#, true));
        data.extend_from_slice(&video_frame(false));
        let mut r = reader(data);

        assert!(matches!(
            r.read_packet().await.unwrap(),
            MxpegPacket::Video { key_frame: true, .. }
        ));
        assert!(matches!(r.read_packet().await.unwrap(), MxpegPacket::Audio(_)));
        assert!(matches!(r.read_packet().await.unwrap(), MxpegPacket::Event(_)));
        assert!(matches!(
            r.read_packet().await.unwrap(),
            MxpegPacket::Video { key_frame: false, .. }
        ));
    }
}
