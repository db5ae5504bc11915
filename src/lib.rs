//! vaultsock - Vault secrets over per-secret Unix domain sockets.
//!
//! Local processes read a secret by connecting to a well-known socket path
//! and reading until EOF. They never hold Vault credentials themselves.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────┐   ServerEvent    ┌──────────────────┐
//!  SIGINT/TERM ──►│  Supervisor  │◄─────────────────│ SocketServer (1) │──┐
//!                 │  status map  │◄─────────────────│ SocketServer (N) │──┤
//!                 └──────┬───────┘                  └──────────────────┘  │
//!                        │ drain: unlink sockets                          │ get(path)
//!                        ▼                                                ▼
//!                   {socket_root}/*.sock                       Arc<dyn SecretStore>
//! ```
//!
//! # Modules
//!
//! - [`config`] - YAML configuration loading and validation
//! - [`store`] - Secret store trait, Vault KV v2 client, in-memory store
//! - [`socket`] - Per-secret socket server and payload rendering
//! - [`supervisor`] - Spawns servers, waits for a signal, removes sockets

pub mod config;
pub mod socket;
pub mod store;
pub mod supervisor;

pub use config::{Config, SecretDescriptor};
pub use socket::server::{SocketServer, StopReason};
pub use store::{KvSecret, SecretStore, StoreError};
pub use supervisor::{ShutdownReport, Supervisor};
