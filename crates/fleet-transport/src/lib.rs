//! fleet-transport — node-to-node and node-to-worker messaging.
//!
//! Persistent TCP connections, optionally wrapped in mutual TLS, carry
//! length-framed [`Packet`]s on named logical channels. Each connection is
//! authenticated once with the cluster secret; afterwards inbound packets
//! are dispatched to the handlers registered for their channel, and
//! request/response pairs are correlated by packet id.
//!
//! # Architecture
//!
//! ```text
//!   Transport ──listen──▶ accept ─▶ auth ─┬─▶ peer link ────┐
//!       │                                 └─▶ service link ─┤
//!       └──connect──▶ dial ─▶ auth ───────▶ peer link ──────┤
//!                                                           ▼
//!                       reader task ─▶ pending waiter │ channel handlers
//!                       writer task ◀─ send / broadcast / send_and_await
//! ```

pub mod client;
mod connection;
pub mod error;
pub mod packet;
pub mod registry;
pub mod sink;
pub mod tls;
pub mod transport;

pub use client::ServiceClient;
pub use error::{TransportError, TransportResult};
pub use packet::{MAX_FRAME_LEN, Packet, PacketCodec};
pub use registry::{BoxFuture, ChannelContext, Origin, PacketHandler, handler};
pub use sink::{PacketSender, RecordingSender, Target};
pub use tls::{CertKeyPair, CertificateAuthority, TlsSettings};
pub use transport::{Transport, TransportConfig, TransportEvent};
