//! Shared platform glue for the emulated machines: the guest-visible bus
//! abstraction peripheral chip models plug into.
#![forbid(unsafe_code)]

pub mod io;

pub use io::{BusDevice, BusError, MemoryMappedBus};
