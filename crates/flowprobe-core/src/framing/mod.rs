//! Record-separator framing used on both stdio directions.
//!
//! A frame is `0x1E <compact UTF-8 JSON> 0x0A`:
//!
//! ```text
//! parent -> child   RS [flows...] LF  RS {"nid":..,"msg":..} LF  ...  <close>
//! child  -> parent  log text ... RS {msg} LF  more log text  RS {msg} LF ...
//! ```
//!
//! Anything the child prints outside a frame is diagnostic noise and is
//! dropped by the decoder.

pub mod decoder;
pub mod encoder;
pub mod reader;

/// Record Separator: marks the start of a frame.
pub const RS: u8 = 0x1E;
/// Line feed: terminates a frame.
pub const LF: u8 = 0x0A;

pub use decoder::StreamDecoder;
pub use encoder::{Injection, encode_frame, encode_input, injections_to};
pub use reader::FrameReader;
