//! Hemmer provider for Strava push subscriptions.
//!
//! Manages the webhook subscriptions of a Strava API application through
//! the Hemmer provider protocol:
//!
//! - resource `strava_push_subscription`: create, read, replace, delete and
//!   import a single subscription
//! - data source `strava_push_subscriptions`: list every subscription of the
//!   application
//!
//! # Handshake Protocol
//!
//! On start the binary prints a single line to stdout and then serves gRPC
//! on that address:
//!
//! ```text
//! HEMMER_PROVIDER|1|127.0.0.1:50051
//! ```
//!
//! # Configuration
//!
//! ```text
//! provider "strava" {
//!   client_id     = "12345"     # or STRAVA_CLIENT_ID
//!   client_secret = "..."       # or STRAVA_CLIENT_SECRET
//! }
//! ```
//!
//! An import ID has the form `<id>,<verify_token>`, since Strava never
//! returns the verify token.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod data_source;
pub mod error;
pub mod logging;
pub mod provider;
pub mod resource;
pub mod schema;
pub mod server;
pub mod testing;
pub mod types;
pub mod validation;

/// Protobuf types and gRPC service for `hemmer.provider.v1`.
#[allow(missing_docs)]
#[allow(clippy::all)]
pub mod generated {
    tonic::include_proto!("hemmer.provider.v1");
}

pub use client::{StravaClient, SubscriptionClient, SubscriptionRecord};
pub use error::{ClientError, ProviderError};
pub use logging::{init_logging, init_logging_with_default, try_init_logging};
pub use provider::StravaProvider;
pub use schema::ProviderSchema;
pub use server::{serve, serve_on, serve_with_options, ProviderService, ServeOptions};
pub use types::{
    AttributeChange, ImportedResource, PlanResult, ProviderMetadata, HANDSHAKE_PREFIX,
    PROTOCOL_VERSION,
};
pub use validation::{validate, validate_result};
