//! Domain Module
//!
//! Host-facing state, events and configuration for the thermostat driver.

pub mod models;
pub mod settings;
