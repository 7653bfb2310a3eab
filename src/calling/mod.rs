//! Two-party video consultation: device access, identity exchange, and the
//! call session lifecycle.

pub mod controller;
pub mod devices;
pub mod error;
pub mod fabric;
pub mod loopback;
pub mod media;
pub mod rendezvous;
pub mod session;
pub mod view;

pub use controller::{CallController, CallControls, CallOptions, SessionSummary};
pub use session::Role;
