//! # collab-protocol
//!
//! Wire protocol for the collab session broker.
//!
//! Clients attach to a project with a `join` frame, publish `update` frames,
//! and receive other members' updates plus `message` frames addressed to them
//! (such as the acknowledgment carrying the server-assigned update id).
//!
//! ## Example
//!
//! ```rust
//! use collab_protocol::{codec, Frame};
//!
//! let frame = Frame::join(3, 7);
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;
pub mod version;

pub use codec::{decode, encode, FrameDecoder, ProtocolError};
pub use frames::{error_codes, Frame, FrameType, MessageKind, ALL_PERMISSIONS};
pub use version::{Version, PROTOCOL_VERSION};
