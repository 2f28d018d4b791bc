//! Library side of the echo-node firmware.
//!
//! Portable logic lives here so it can be unit-tested off-target; the
//! hardware bring-up and task wiring live in `src/bin/main.rs`.

#![no_std]

pub mod link;
pub mod mqtt;
