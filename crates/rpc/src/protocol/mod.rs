//! Wire protocol: framing and envelopes.

pub mod envelope;
pub mod framing;

pub use envelope::Envelope;
pub use framing::{FRAME_HEADER_SIZE, FrameCodec, FrameReader, FrameWriter};
