//! Infrastructure Module
//!
//! Crypto, logging and the BLE layer the domain code runs on.

pub mod bluetooth;
pub mod crypto;
pub mod logging;
