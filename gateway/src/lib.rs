//! Portico Gateway - Session-aware edge for a chat service.
//!
//! This crate provides the gateway in front of the Portico backends,
//! responsible for:
//! - Issuing signed session tokens and keeping session state in a TTL cache
//! - Holding one WebSocket push connection per signed-in user
//! - Fanning broker events out to the users they target
//! - Reverse-proxying backend routes with the caller's identity attached
//!
//! # Architecture
//!
//! Requests enter through [`routes`]. Sessions are resolved by
//! [`auth::Authenticator`] on top of [`session::SessionStore`]. The
//! [`hub::BroadcastHub`] runs on its own task, reading a
//! [`broker::MessageSource`] and delivering into the shared
//! [`registry::ConnectionRegistry`]. Proxied routes go through
//! [`proxy::ReverseProxy`].

pub mod auth;
pub mod broker;
pub mod cache;
pub mod config;
pub mod directory;
pub mod error;
pub mod hub;
pub mod proxy;
pub mod redis_cache;
pub mod registry;
pub mod routes;
pub mod session;
pub mod sid;
pub mod types;
