//! Protocol-translating proxy between a Mobotix IP doorbell camera and
//! MoBell mobile clients.
//!
//! The proxy keeps a single upstream connection to the camera, fans the
//! live MxPEG video/audio/event stream out to every connected client,
//! serializes client commands (door trigger, bell acknowledgement, audio
//! talk-back) back upstream, synthesizes doorbell-ring notifications and
//! arbitrates exclusive access to the half-duplex audio-in channel.

pub mod codec;
pub mod error;
pub mod logging;
pub mod mxpeg;
pub mod server;
pub mod stream;

pub use error::{MxpegError, MxpegResult};
pub use server::{Server, ServerConfig};
