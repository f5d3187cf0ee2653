//! # tether-protocol
//!
//! Wire protocol definitions for the Tether coordination server.
//!
//! This crate defines the JSON envelope exchanged on the application socket,
//! the error taxonomy carried by error replies, the size guards applied to
//! inbound traffic, and the small control dialect of the stream relay.
//!
//! ## Example
//!
//! ```rust
//! use tether_protocol::{codec, kinds};
//!
//! let raw = r#"{"v":1,"t":"hello","id":"h1","ts":0,"body":{"resume":{}}}"#;
//! let envelope = codec::decode(raw).unwrap();
//! assert_eq!(envelope.t, kinds::HELLO);
//! ```

pub mod codec;
pub mod envelope;
pub mod error;
pub mod relay;

pub use codec::{decode, encode, ProtocolError, Rejected};
pub use envelope::{kinds, now_millis, Envelope, PROTOCOL_VERSION};
pub use error::ErrorCode;
pub use relay::{RelayCommand, RelayNotice, StreamState};
