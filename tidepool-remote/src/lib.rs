//! # tidepool-remote — cached, observable access to remote data
//!
//! [`RemoteCache`] keeps a local map of remote values keyed by
//! `(scope, path)` and exposes it through the same
//! [`Observable`](tidepool_core::Observable) contract as the local stores.
//!
//! ```text
//!   UI ──► RemoteCache ──► read()                     (local only)
//!               │     ──► preload() / list()  ─┐
//!               │     ──► write() (optimistic) ─┼──► RemoteApi ──► WsRemote ──► socket
//!               │     ──► poll observers ──────┘        (bearer token, timeout)
//!               ▼
//!        ChangeNotifier (versions, batching, scheduler)
//! ```
//!
//! ## Modules
//!
//! - [`cache`] — [`RemoteCache`]: dedupe, optimistic writes, polling, teardown
//! - [`api`] — [`RemoteApi`] contract, [`AuthToken`], [`RemoteError`]
//! - [`key`] — [`RemotePath`] and the flattened [`CacheKey`]
//! - [`protocol`] — bincode request/response frames
//! - [`ws`] — [`WsRemote`], the WebSocket implementation of [`RemoteApi`]

pub mod api;
pub mod cache;
pub mod key;
pub mod protocol;
pub mod ws;

pub use api::{with_timeout, AuthToken, RemoteApi, RemoteConfig, RemoteError};
pub use cache::RemoteCache;
pub use key::{CacheKey, RemotePath};
pub use ws::WsRemote;
