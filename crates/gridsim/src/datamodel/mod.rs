//! Data Model Store
//!
//! Coil/register maps per device profile plus the flat MMS path→value map.
//! This layer has no notion of control or GOOSE; [`crate::substation`] wraps
//! it with those behaviours.

mod profile;
mod store;

pub use profile::*;
pub use store::*;
