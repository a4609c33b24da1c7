//! Gridsim Types - Core value and time definitions shared by the simulator
//!
//! This crate contains the pure data structures used by both the Structured
//! Text runtime and the device-simulation engine:
//!
//! - [`Value`] - the scalar carried by registers, data attributes and script variables
//! - [`PointType`] - the four Modbus address spaces
//! - [`Clock`] - injectable millisecond time source

mod clock;
mod point;
mod value;

pub use clock::*;
pub use point::*;
pub use value::*;
