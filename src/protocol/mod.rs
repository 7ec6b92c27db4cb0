//! Session channel protocol.
//!
//! One logical duplex stream of typed NDJSON messages per student, plus one
//! observer subscription, all multiplexed through the relay.
//!
//! - `codec`: [`LinesCodec`](tokio_util::codec::LinesCodec)-based line framing.
//! - `messages`: the typed message families for every direction.
//! - `reader` / `writer`: per-channel tasks bridging a stream and `mpsc`.
//! - `handshake`: bounded `join` / `admin_join` exchanges.
//! - `transport`: the [`Connector`](transport::Connector) seam and reconnection policy.

pub mod codec;
pub mod handshake;
pub mod messages;
pub mod reader;
pub mod transport;
pub mod writer;
