//! Project Configuration Types
//!
//! Defines the structure of project files on disk.
//!
//! ```text
//! project.toml
//! devices/<id>.device.toml
//! scripts/<id>.st
//! ied/*.json
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use gridsim_types::{PointType, Value};
use serde::{Deserialize, Serialize};

use crate::control::{DEFAULT_KILL_SWITCH_COIL, Interlock, KillSwitch};
use crate::datamodel::DEFAULT_PROFILE;
use crate::engine::{DeviceConfig, NoiseTarget};
use crate::goose::GooseConfig;
use crate::server::{EndpointSpec, IedNode, Protocol};
use crate::substation::BreakerBinding;

/// Project manifest (project.toml)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectManifest {
    pub project: ProjectInfo,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
    #[serde(default)]
    pub breaker_bindings: Vec<BreakerBinding>,
    #[serde(default)]
    pub interlock: InterlockConfig,
    /// Analog inputs perturbed every tick
    #[serde(default)]
    pub noise: Vec<NoiseTarget>,
}

/// Project information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub id: String,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub description: Option<String>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

/// One relay listener
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub protocol: Protocol,
    /// Empty binds the adapter chosen at runtime
    #[serde(default)]
    pub ip: String,
    pub port: u16,
    pub name: Option<String>,
    pub unit_id: Option<u8>,
    pub backend_host: Option<String>,
    pub backend_port: Option<u16>,
}

impl EndpointConfig {
    pub fn to_spec(&self) -> EndpointSpec {
        EndpointSpec {
            ip: self.ip.clone(),
            port: self.port,
            name: self.name.clone(),
            unit_id: self.unit_id,
            backend_host: self.backend_host.clone(),
            backend_port: self.backend_port,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterlockConfig {
    #[serde(default = "default_profile")]
    pub kill_switch_profile: String,
    #[serde(default = "default_kill_switch_coil")]
    pub kill_switch_coil: u16,
}

impl Default for InterlockConfig {
    fn default() -> Self {
        Self {
            kill_switch_profile: default_profile(),
            kill_switch_coil: default_kill_switch_coil(),
        }
    }
}

impl InterlockConfig {
    pub fn to_interlock(&self) -> Interlock {
        Interlock {
            kill_switch: KillSwitch {
                profile: self.kill_switch_profile.clone(),
                coil: self.kill_switch_coil,
            },
        }
    }
}

fn default_profile() -> String {
    DEFAULT_PROFILE.to_string()
}

fn default_kill_switch_coil() -> u16 {
    DEFAULT_KILL_SWITCH_COIL
}

/// Device file (devices/*.device.toml)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceFile {
    pub device: DeviceSection,
    #[serde(default)]
    pub points: Vec<PointConfig>,
    #[serde(default)]
    pub attributes: Vec<AttributeConfig>,
    #[serde(default)]
    pub goose: Vec<GooseBlockConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSection {
    #[serde(flatten)]
    pub config: DeviceConfig,
    /// Script path relative to the project root; `scripts/<id>.st` when unset
    pub script: Option<String>,
    /// Modbus unit id the device's profile answers to
    pub unit_id: Option<u8>,
}

impl DeviceSection {
    pub fn script_path(&self) -> PathBuf {
        match &self.script {
            Some(script) => PathBuf::from(script),
            None => Path::new("scripts").join(format!("{}.st", self.config.id)),
        }
    }
}

/// Initial value of a Modbus point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointConfig {
    pub address: u16,
    #[serde(rename = "type")]
    pub point_type: PointType,
    #[serde(default)]
    pub value: Value,
}

/// Initial value of an MMS data attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeConfig {
    pub path: String,
    pub value: Value,
}

/// A GOOSE control block published by the device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GooseBlockConfig {
    pub path: String,
    pub config: GooseConfig,
    #[serde(default)]
    pub dataset: Vec<String>,
}

/// A fully loaded project
#[derive(Debug, Clone)]
pub struct Project {
    pub path: PathBuf,
    pub manifest: ProjectManifest,
    pub devices: BTreeMap<String, DeviceFile>,
    /// Script source by device id
    pub scripts: BTreeMap<String, String>,
    pub ied_models: Vec<IedNode>,
}

impl Project {
    /// Endpoints configured for one protocol
    pub fn endpoints(&self, protocol: Protocol) -> Vec<EndpointSpec> {
        self.manifest
            .endpoints
            .iter()
            .filter(|e| e.protocol == protocol)
            .map(EndpointConfig::to_spec)
            .collect()
    }

    /// Model offered to MMS clients
    pub fn ied_model(&self) -> Option<&IedNode> {
        self.ied_models.first()
    }

    /// Devices whose script lives at `relative`
    pub fn devices_using_script<'a>(&'a self, relative: &'a Path) -> impl Iterator<Item = &'a str> {
        self.devices
            .values()
            .filter(move |d| d.device.script_path() == relative)
            .map(|d| d.device.config.id.as_str())
    }
}
