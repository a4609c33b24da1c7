//! Profile tables and MMS attribute map

use std::collections::BTreeMap;

use gridsim_types::{PointType, Value};
use tracing::trace;

use super::profile::{DEFAULT_PROFILE, DeviceProfile};
use crate::modbus::{ExceptionCode, Request, Response};

/// Live data of one simulated substation
#[derive(Debug, Clone)]
pub struct DataModel {
    /// Shared profile used when no other profile matches
    default_profile: DeviceProfile,
    profiles: BTreeMap<String, DeviceProfile>,
    attributes: BTreeMap<String, Value>,
}

impl Default for DataModel {
    fn default() -> Self {
        Self::new()
    }
}

impl DataModel {
    /// Empty model holding only the shared default profile
    pub fn new() -> Self {
        Self {
            default_profile: DeviceProfile::new(DEFAULT_PROFILE),
            profiles: BTreeMap::new(),
            attributes: BTreeMap::new(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Profiles
    // ─────────────────────────────────────────────────────────────────────

    /// Insert or replace a profile
    pub fn insert_profile(&mut self, profile: DeviceProfile) {
        if profile.id == DEFAULT_PROFILE {
            self.default_profile = profile;
        } else {
            self.profiles.insert(profile.id.clone(), profile);
        }
    }

    /// Remove a profile; the default profile cannot be removed
    pub fn remove_profile(&mut self, id: &str) -> Option<DeviceProfile> {
        self.profiles.remove(id)
    }

    pub fn has_profile(&self, id: &str) -> bool {
        id == DEFAULT_PROFILE || self.profiles.contains_key(id)
    }

    /// Profile by id, or the default profile
    pub fn profile(&self, id: &str) -> &DeviceProfile {
        self.profiles.get(id).unwrap_or(&self.default_profile)
    }

    /// Mutable profile by id, or the default profile
    pub fn profile_mut(&mut self, id: &str) -> &mut DeviceProfile {
        self.profiles
            .get_mut(id)
            .unwrap_or(&mut self.default_profile)
    }

    /// Profile id answering to a Modbus unit id, or the default profile
    pub fn profile_id_for_unit(&self, unit_id: u8) -> &str {
        self.profiles()
            .find(|p| p.unit_id == Some(unit_id))
            .map(|p| p.id.as_str())
            .unwrap_or(DEFAULT_PROFILE)
    }

    /// Every profile, default first
    pub fn profiles(&self) -> impl Iterator<Item = &DeviceProfile> {
        std::iter::once(&self.default_profile).chain(self.profiles.values())
    }

    // ─────────────────────────────────────────────────────────────────────
    // MMS attributes
    // ─────────────────────────────────────────────────────────────────────

    /// Stored value, or `None` if the path was never written
    pub fn read_mms(&self, path: &str) -> Option<&Value> {
        self.attributes.get(path)
    }

    /// Unconditional upsert; returns whether the value changed
    pub fn write_mms(&mut self, path: &str, value: Value) -> bool {
        let changed = self
            .attributes
            .get(path)
            .is_none_or(|previous| !previous.same_as(&value));
        trace!(path, %value, changed, "write_mms");
        self.attributes.insert(path.to_string(), value);
        changed
    }

    pub fn remove_mms(&mut self, path: &str) -> Option<Value> {
        self.attributes.remove(path)
    }

    /// All attributes in path order
    pub fn attributes(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.attributes.iter()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Modbus execution
    // ─────────────────────────────────────────────────────────────────────

    /// Execute a request against the profile addressed by `unit_id`
    pub fn handle_modbus(&mut self, unit_id: u8, request: &Request) -> Response {
        let profile_id = self.profile_id_for_unit(unit_id).to_string();
        self.execute_modbus(&profile_id, request)
    }

    /// Execute a request against a named profile
    ///
    /// Every address touched must already exist in the profile.
    pub fn execute_modbus(&mut self, profile_id: &str, request: &Request) -> Response {
        let function = request.function();
        let illegal_address = Response::exception(function.code(), ExceptionCode::IllegalDataAddress);
        let profile = self.profile_mut(profile_id);

        match *request {
            Request::Read {
                function,
                address,
                quantity,
            } => {
                let Some(table) = function.read_table() else {
                    return Response::exception(function.code(), ExceptionCode::IllegalFunction);
                };
                if address as u32 + quantity as u32 > 0x1_0000 {
                    return illegal_address;
                }
                let addresses = (0..quantity).map(|i| address + i);

                if table.is_bit() {
                    let values: Option<Vec<bool>> =
                        addresses.map(|a| profile.bit(table, a)).collect();
                    match values {
                        Some(values) => Response::Bits { function, values },
                        None => illegal_address,
                    }
                } else {
                    let values: Option<Vec<u16>> =
                        addresses.map(|a| profile.register(table, a)).collect();
                    match values {
                        Some(values) => Response::Registers { function, values },
                        None => illegal_address,
                    }
                }
            }
            Request::WriteSingleCoil { address, value } => {
                match profile.coils.get_mut(&address) {
                    Some(slot) => {
                        *slot = value;
                        Response::WriteSingleCoil { address, value }
                    }
                    None => illegal_address,
                }
            }
            Request::WriteSingleRegister { address, value } => {
                match profile.holding_registers.get_mut(&address) {
                    Some(slot) => {
                        *slot = value;
                        Response::WriteSingleRegister { address, value }
                    }
                    None => illegal_address,
                }
            }
        }
    }

    /// Convenience for tables addressed by [`PointType`]
    pub fn read_point(&self, profile_id: &str, table: PointType, address: u16) -> Option<Value> {
        let profile = self.profile(profile_id);
        if table.is_bit() {
            profile.bit(table, address).map(Value::Bool)
        } else {
            profile.register(table, address).map(Value::from)
        }
    }
}
