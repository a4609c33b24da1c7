//! Modbus point address spaces

use std::fmt;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// The four Modbus data tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
pub enum PointType {
    /// Read/write single bit
    Coil,
    /// Read-only single bit
    DiscreteInput,
    /// Read/write 16-bit register
    HoldingRegister,
    /// Read-only 16-bit register
    InputRegister,
}

impl PointType {
    /// Whether points of this table hold a single bit
    pub fn is_bit(self) -> bool {
        matches!(self, PointType::Coil | PointType::DiscreteInput)
    }
}

impl fmt::Display for PointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PointType::Coil => "coil",
            PointType::DiscreteInput => "discrete_input",
            PointType::HoldingRegister => "holding_register",
            PointType::InputRegister => "input_register",
        };
        f.write_str(name)
    }
}
