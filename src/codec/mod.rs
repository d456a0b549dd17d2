//! Key-frame codec interface.
//!
//! The fan-out server feeds every upstream video packet to a codec and asks
//! it for a complete key frame whenever a viewer joins mid-stream. The
//! interface is deliberately small so a transcoding implementation (e.g.
//! one backed by libavcodec) can be dropped in without touching the server.

use bytes::Bytes;

use crate::mxpeg::markers;

pub trait FrameCodec: Send {
    fn on_stream_start(&mut self);
    fn on_stream_stop(&mut self);

    /// Feed one video packet. Returns `false` when the packet could not be
    /// decoded; the server treats that as a stream desync.
    fn on_video_packet(&mut self, data: &[u8]) -> bool;

    /// A complete, independently decodable frame for a late joiner, or
    /// `None` when no key frame has been seen yet.
    fn encode_frame(&mut self) -> Option<Bytes>;
}

/// Default codec: remembers the most recent key frame and re-emits it for
/// late joiners, without any re-encoding.
#[derive(Default)]
pub struct KeyFrameCache {
    key_frame: Option<Bytes>,
}

impl KeyFrameCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FrameCodec for KeyFrameCache {
    fn on_stream_start(&mut self) {
        self.key_frame = None;
    }

    fn on_stream_stop(&mut self) {}

    fn on_video_packet(&mut self, data: &[u8]) -> bool {
        if data.len() < 4 || data[0] != 0xff || data[1] != markers::SOI {
            return false;
        }

        if is_key_frame(data) {
            self.key_frame = Some(Bytes::copy_from_slice(data));
        }

        true
    }

    fn encode_frame(&mut self) -> Option<Bytes> {
        self.key_frame.clone()
    }
}

/// A frame carrying SOF0 is independently decodable.
fn is_key_frame(frame: &[u8]) -> bool {
    let l = frame.len();
    let mut p = 2;

    while p + 4 < l {
        if frame[p] != 0xff {
            return false;
        }

        let m = frame[p + 1];
        if m == markers::SOF0 {
            return true;
        }
        if m == markers::SOS || m == markers::EOI {
            return false;
        }

        let s = (((frame[p + 2] as usize) << 8) | frame[p + 3] as usize) + 2;
        if p + s > l {
            return false;
        }
        p += s;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(marker: u8, payload: &[u8]) -> Vec<u8> {
        let l = payload.len() + 2;
        let mut s = vec![0xff, marker, (l >> 8) as u8, l as u8];
        s.extend_from_slice(payload);
        s
    }

    fn frame(key: bool) -> Vec<u8> {
        let mut f = vec![0xff, markers::SOI];
        if key {
            f.extend_from_slice(&seg(markers::DQT, &[0; 5]));
            f.extend_from_slice(&seg(markers::SOF0, &[8, 0, 16, 0, 16, 1]));
        }
        f.extend_from_slice(&seg(markers::SOS, &[1]));
        f.extend_from_slice(&[0x10, 0xff, 0x00, 0xff, markers::EOI]);
        f
    }

    #[test]
    fn caches_latest_key_frame() {
        let mut codec = KeyFrameCache::new();
        codec.on_stream_start();

        assert!(codec.encode_frame().is_none());

        let key = frame(true);
        assert!(codec.on_video_packet(&key));
        assert_eq!(codec.encode_frame().unwrap(), key.as_slice());

        // motion frames do not replace the cached key frame
        assert!(codec.on_video_packet(&frame(false)));
        assert_eq!(codec.encode_frame().unwrap(), key.as_slice());
    }

    #[test]
    fn rejects_non_jpeg_packet() {
        let mut codec = KeyFrameCache::new();
        assert!(!codec.on_video_packet(&[0x00, 0x01, 0x02, 0x03]));
        assert!(!codec.on_video_packet(&[]));
    }

    #[test]
    fn stream_restart_clears_the_cache() {
        let mut codec = KeyFrameCache::new();
        codec.on_stream_start();
        codec.on_video_packet(&frame(true));
        codec.on_stream_start();
        assert!(codec.encode_frame().is_none());
    }
}
