//! A multi-endpoint TLS/HTTP2 server runtime.
//!
//! Configure one or more [`config::ListenerConfig`]s, wrap them in
//! [`wrangler::Wrangler`]s behind a [`handler::Handler`], and drive them all
//! together through an [`endpoint_manager::EndpointManager`]. Admission
//! control is provided by [`token_bucket::TokenBucket`]; causal event
//! streams (e.g. for a reload/config-change audit trail) by [`event`].

#![recursion_limit = "256"]

pub mod component;
pub mod config;
pub mod context;
pub mod endpoint_manager;
pub mod error;
pub mod event;
pub mod file_preserver;
pub mod handler;
pub mod ids;
pub mod logging;
pub mod net;
pub mod request;
pub mod threadlet;
pub mod time;
pub mod token_bucket;
pub mod tls;
pub mod wrangler;

pub use component::Component;
pub use error::{BoxError, Error};
pub use handler::Handler;
pub use ids::Identifier;
