//! Cross-device sync and message-routing hub.
//!
//! Devices of one user (phone, desktop, watch, car, TV...) connect to the
//! hub, which validates their envelopes, answers user input through the
//! responder collaborator, and fans state changes out to the user's other
//! devices through a priority queue with retries, per-device filtering,
//! offline buffering and conflict resolution.

pub mod auth;
pub mod collab;
pub mod config;
pub mod envelope;
pub mod error;
pub mod gateway;
pub mod hub;
pub mod metrics;
pub mod registry;
pub mod sync;

pub use config::HubConfig;
pub use envelope::{DeviceClass, MessageEnvelope, MessageType, Priority};
pub use error::{HubError, HubResult, ValidationError};
pub use hub::Hub;
