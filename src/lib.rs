//! CouchDB Auth Library
//!
//! Gate an application behind CouchDB session authentication, provision
//! each user's database on signup, and keep it replicated locally.

pub mod auth;
pub mod client;
pub mod commands;
pub mod config;
pub mod controller;
pub mod logging;
pub mod provision;
pub mod retry;
pub mod storage;
pub mod store;
pub mod sync;
pub mod view;

pub use auth::{AuthContext, RenderState, Route, User};
pub use config::{Adapter, AuthConfig, ConfigError};
pub use controller::{Authentication, AuthenticationBuilder};
pub use store::{DocumentStore, MemoryStore, StoreFactory};
pub use sync::{ChangesSync, SyncEngine, SyncHandle};
pub use view::{AppProps, Screen, Screens};
