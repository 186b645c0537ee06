//! Riptide Common - shared leaf types for the riptide layer-4 balancer
//!
//! This crate provides the types every other riptide crate agrees on:
//! - Wire-format endpoint tuples (`Tuple2`, `Tuple4`)
//! - Balancer configuration (`BalancerConfig`)
//! - The control-plane error taxonomy (`ServiceError`)
//!
//! Everything here is allocation-free, `Copy` where the wire format is
//! fixed-size, and safe to move across the core boundary.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod tuple;

pub use config::*;
pub use error::*;
pub use tuple::*;
