#![warn(missing_docs)]

//! RingLink benchmark drivers: bandwidth sweep and ping-pong over any transport backend

pub mod bench;
pub mod cli;
pub mod cpu;
pub mod size;
