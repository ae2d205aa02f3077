//! Client-side resilience layer for a pregnancy-care companion app.
//!
//! - [`cache`]: local-first records that stay readable while offline
//! - [`queue`]: writes that survive restarts until the server confirms them
//! - [`reminders`]: local notifications that follow appointment changes
//!
//! [`Careline`] wires them together over host-provided collaborators.

pub mod appointments;
pub mod cache;
pub mod clock;
pub mod config;
pub mod context;
pub mod estimate;
pub mod event;
pub mod logging;
pub mod queue;
pub mod reminders;
pub mod remote;
pub mod store;

#[cfg(test)]
mod testing;

pub use context::{Careline, Dependencies};
pub use event::{Event, EventHandler, EventSender};
