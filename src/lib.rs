//! # Moisture Logger Library
//!
//! Log soil-moisture readings from a serial-attached microcontroller.
//!
//! This library provides the acquisition pipeline: the serial link and its
//! connection monitor, the line protocol parser, the collection controller
//! and the SQLite-backed reading store.

pub mod app;
pub mod collection;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod monitor;
pub mod sensor;
pub mod serial;
pub mod store;
