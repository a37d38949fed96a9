//! # Sensor Line Protocol Module
//!
//! Implementation of the line-oriented text protocol spoken by the
//! moisture sensor firmware.
//!
//! This module handles:
//! - Host-to-device command bytes (start, stop, liveness probe)
//! - Decoding raw line bytes with an encoding fallback chain
//! - Classifying lines as data samples or status events

pub mod protocol;
pub mod decoder;
