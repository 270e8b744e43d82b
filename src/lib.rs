#![cfg_attr(not(test), no_std)]

//! The coordination core of a DMA-based data-acquisition pipeline.
//!
//! Interrupt handlers reconstruct bit-serial samples from GPIO edges ([acquisition]), move each
//! completed scan through a DMA engine ([dma]), and keep the network receive path alive
//! ([watchdog]). A cooperative main loop ([session]) forwards the acquired data to a remote peer
//! as datagrams ([telemetry]) and reacts to its commands. All of them communicate through the
//! context-tagged state in [shared].
//!
//! Peripheral access is abstracted by the traits in [hal], so the core runs unmodified on the
//! host for testing.

pub mod acquisition;
pub mod config;
pub mod debug_util;
pub mod dma;
pub mod error;
pub mod hal;
pub mod platform;
pub mod session;
pub mod shared;
pub mod telemetry;
pub mod watchdog;

#[cfg(test)]
mod test_util;

pub use config::Config;
pub use error::{Error, Result};
pub use platform::{Core, CoreResources, InterruptSource};
pub use session::Session;
