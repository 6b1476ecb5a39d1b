//! MQTT 3.x wire protocol.
//!
//! Layered bottom-up: [`codec`] holds the primitive encodings, [`buffer`]
//! the growable output buffer, [`frame`] the header + remaining-length
//! envelope, [`packet`] the typed control packets and [`v3`] the
//! version-aware packet codec.

pub mod buffer;
pub mod codec;
pub mod frame;
pub mod packet;
pub mod v3;

pub use buffer::BufferWriter;
pub use codec::{decode_variable_int, encode_variable_int, variable_int_len};
pub use frame::{write_frame, Frame, FrameReader};
pub use packet::*;
pub use v3::{detect_version, Codec};

/// Maximum packet size (1MB default).
pub const MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Largest value the remaining-length field can carry.
pub const MAX_REMAINING_LENGTH: u32 = 268_435_455;
