//! Device profiles
//!
//! A profile is one Modbus register space: four ordered tables keyed by
//! wire address.

use std::collections::BTreeMap;

use gridsim_types::{PointType, Value, ValueConversionError};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// Identifier of the profile used when nothing else matches
pub const DEFAULT_PROFILE: &str = "default";

/// One addressed point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Point {
    pub address: u16,
    #[serde(rename = "type")]
    pub point_type: PointType,
    pub value: Value,
}

/// Modbus register space of a device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceProfile {
    pub id: String,
    /// Unit id this profile answers to, if any
    pub unit_id: Option<u8>,
    pub coils: BTreeMap<u16, bool>,
    pub discrete_inputs: BTreeMap<u16, bool>,
    pub holding_registers: BTreeMap<u16, u16>,
    pub input_registers: BTreeMap<u16, u16>,
}

impl DeviceProfile {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_unit_id(mut self, unit_id: u8) -> Self {
        self.unit_id = Some(unit_id);
        self
    }

    /// Read a bit from the coil or discrete-input table
    pub fn bit(&self, table: PointType, address: u16) -> Option<bool> {
        match table {
            PointType::Coil => self.coils.get(&address).copied(),
            PointType::DiscreteInput => self.discrete_inputs.get(&address).copied(),
            PointType::HoldingRegister | PointType::InputRegister => None,
        }
    }

    /// Read a word from the holding or input register table
    pub fn register(&self, table: PointType, address: u16) -> Option<u16> {
        match table {
            PointType::HoldingRegister => self.holding_registers.get(&address).copied(),
            PointType::InputRegister => self.input_registers.get(&address).copied(),
            PointType::Coil | PointType::DiscreteInput => None,
        }
    }

    /// Whether `address` exists in `table`
    pub fn contains(&self, table: PointType, address: u16) -> bool {
        match table {
            PointType::Coil => self.coils.contains_key(&address),
            PointType::DiscreteInput => self.discrete_inputs.contains_key(&address),
            PointType::HoldingRegister => self.holding_registers.contains_key(&address),
            PointType::InputRegister => self.input_registers.contains_key(&address),
        }
    }

    /// Upsert a point from a loosely typed value
    pub fn set(
        &mut self,
        table: PointType,
        address: u16,
        value: &Value,
    ) -> Result<(), ValueConversionError> {
        match table {
            PointType::Coil => {
                self.coils.insert(address, value.truthy());
            }
            PointType::DiscreteInput => {
                self.discrete_inputs.insert(address, value.truthy());
            }
            PointType::HoldingRegister => {
                self.holding_registers.insert(address, u16::try_from(value)?);
            }
            PointType::InputRegister => {
                self.input_registers.insert(address, u16::try_from(value)?);
            }
        }
        Ok(())
    }

    /// Every point across the four tables
    pub fn points(&self) -> Vec<Point> {
        let bits = |table: PointType, map: &BTreeMap<u16, bool>| {
            map.iter()
                .map(move |(address, v)| Point {
                    address: *address,
                    point_type: table,
                    value: Value::Bool(*v),
                })
                .collect::<Vec<_>>()
        };
        let words = |table: PointType, map: &BTreeMap<u16, u16>| {
            map.iter()
                .map(move |(address, v)| Point {
                    address: *address,
                    point_type: table,
                    value: Value::from(*v),
                })
                .collect::<Vec<_>>()
        };

        let mut points = bits(PointType::Coil, &self.coils);
        points.extend(bits(PointType::DiscreteInput, &self.discrete_inputs));
        points.extend(words(PointType::HoldingRegister, &self.holding_registers));
        points.extend(words(PointType::InputRegister, &self.input_registers));
        points
    }
}
