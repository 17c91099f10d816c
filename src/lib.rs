//! Leadflow: lead intake and quiet-hours-aware follow-up automation for
//! real-estate agents.

pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod intake;
pub mod leads;
pub mod messaging;
pub mod scheduler;
pub mod sequences;
pub mod store;
pub mod tenants;
pub mod time_window;
pub mod timeline;

#[cfg(test)]
pub(crate) mod testing;
