//! Per-secret Unix domain socket servers.
//!
//! # Architecture
//!
//! ```text
//! Consumer process                     vaultsock
//! ┌──────────────────┐                ┌──────────────────────────┐
//! │ UnixStream       │   connect      │ SocketServer             │
//! │ read to EOF      │───────────────►│  UnixListener (0700)     │
//! │                  │◄───────────────│  accept → get → write    │──► SecretStore
//! └──────────────────┘  raw bytes,    │  → close, one at a time  │
//!                       then EOF      └──────────────────────────┘
//! ```
//!
//! # Wire Protocol
//!
//! None. The server reads nothing from the client, writes either the raw
//! field value or a pretty-printed dump of the whole secret, and closes.
//! A connection closed with zero bytes means the secret could not be served.

pub mod payload;
pub mod server;
