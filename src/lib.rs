//! KeyRelay — adaptive poller and client-side cache for rotating credentials.
//!
//! The server half polls a credential source, learns how often the
//! credential rotates, and serves the current value over HTTP. The client
//! half ([`RemoteKeyFetcher`]) fetches from such an endpoint and caches the
//! key per provider until it expires.

pub mod auth;
pub mod clock;
pub mod config;
pub mod error;
pub mod poller;
pub mod provider;
pub mod server;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{DynamicKeyConfig, PollerConfig, RelayConfig, ServerConfig};
pub use error::{RelayError, Result};
pub use poller::{
    AdaptivePoller, CommandSource, CredentialSource, PollerStats, PollerTask, TokenSnapshot,
};
pub use provider::{KeyCache, RemoteKeyFetcher};
