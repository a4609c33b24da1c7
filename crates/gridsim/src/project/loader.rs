//! Project Loader
//!
//! Loads project configuration from disk and applies it to an engine.

use std::collections::BTreeMap;
use std::path::Path;

use tokio::fs;
use tracing::{debug, info, warn};

use super::config::*;
use crate::datamodel::DeviceProfile;
use crate::engine::{Engine, EngineError, NoiseEnvironment};
use crate::server::IedNode;
use crate::substation::WriteSource;

/// Error type for project loading
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Project path does not exist: {0}")]
    PathNotFound(std::path::PathBuf),

    #[error("Project manifest not found: {0}")]
    ManifestNotFound(std::path::PathBuf),

    #[error("Failed to read file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Project loader
pub struct ProjectLoader;

impl ProjectLoader {
    /// Load a project from the given path
    pub async fn load(path: impl AsRef<Path>) -> Result<Project, LoadError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(LoadError::PathNotFound(path.to_path_buf()));
        }

        info!("Loading project from: {}", path.display());

        let manifest_path = path.join("project.toml");
        if !manifest_path.exists() {
            return Err(LoadError::ManifestNotFound(manifest_path));
        }

        let manifest_content = fs::read_to_string(&manifest_path).await?;
        let manifest: ProjectManifest = toml::from_str(&manifest_content)?;
        info!("Loaded project manifest: {} ({})", manifest.project.name, manifest.project.id);

        let devices = Self::load_devices(path).await?;
        info!("Loaded {} devices", devices.len());

        let mut scripts = BTreeMap::new();
        for device in devices.values() {
            if let Some(source) = Self::load_script(path, &device.device).await? {
                scripts.insert(device.device.config.id.clone(), source);
            }
        }
        info!("Loaded {} scripts", scripts.len());

        let ied_models = Self::load_ied_models(path).await?;
        info!("Loaded {} IED models", ied_models.len());

        Ok(Project {
            path: path.to_path_buf(),
            manifest,
            devices,
            scripts,
            ied_models,
        })
    }

    /// Load all devices from the devices/ directory
    async fn load_devices(project_path: &Path) -> Result<BTreeMap<String, DeviceFile>, LoadError> {
        let devices_dir = project_path.join("devices");
        let mut devices = BTreeMap::new();

        if !devices_dir.exists() {
            debug!("No devices directory found");
            return Ok(devices);
        }

        let mut entries = fs::read_dir(&devices_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();

            // Only process .device.toml files
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(".device.toml") {
                continue;
            }
            match Self::load_device(&path).await {
                Ok(device) => {
                    debug!("Loaded device: {}", device.device.config.id);
                    devices.insert(device.device.config.id.clone(), device);
                }
                Err(e) => {
                    warn!("Failed to load device from {}: {}", path.display(), e);
                }
            }
        }

        Ok(devices)
    }

    /// Load a single device file
    async fn load_device(path: &Path) -> Result<DeviceFile, LoadError> {
        let content = fs::read_to_string(path).await?;
        let device: DeviceFile = toml::from_str(&content)?;
        Ok(device)
    }

    /// Script source of a device, if its file exists
    async fn load_script(
        project_path: &Path,
        device: &DeviceSection,
    ) -> Result<Option<String>, LoadError> {
        let script_path = project_path.join(device.script_path());
        if !script_path.exists() {
            if device.script.is_some() {
                warn!(device_id = %device.config.id, path = %script_path.display(), "Script not found");
            }
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(&script_path).await?))
    }

    /// Load IED model documents from ied/
    async fn load_ied_models(project_path: &Path) -> Result<Vec<IedNode>, LoadError> {
        let ied_dir = project_path.join("ied");
        let mut models = Vec::new();

        if !ied_dir.exists() {
            debug!("No ied directory found");
            return Ok(models);
        }

        let mut paths = Vec::new();
        let mut entries = fs::read_dir(&ied_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        paths.sort();

        for path in paths {
            let content = fs::read_to_string(&path).await?;
            match serde_json::from_str::<IedNode>(&content) {
                Ok(model) => models.push(model),
                Err(e) => warn!("Failed to parse IED model {}: {}", path.display(), e),
            }
        }
        Ok(models)
    }

    /// Reload a single device (returns None if it was deleted)
    pub async fn reload_device(
        project_path: &Path,
        device_id: &str,
    ) -> Result<Option<(DeviceFile, Option<String>)>, LoadError> {
        let device_path = project_path
            .join("devices")
            .join(format!("{}.device.toml", device_id));

        if !device_path.exists() {
            return Ok(None);
        }

        let device = Self::load_device(&device_path).await?;
        let script = Self::load_script(project_path, &device.device).await?;
        Ok(Some((device, script)))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Applying a project
// ─────────────────────────────────────────────────────────────────────────────

impl Project {
    /// Install everything the project describes into `engine`
    ///
    /// Scripts that fail to compile are reported and skipped; the rest of
    /// the project still applies.
    pub fn apply(&self, engine: &mut Engine) -> Vec<EngineError> {
        let substation = engine.substation_mut();
        substation.set_interlock(self.manifest.interlock.to_interlock());
        substation.set_breaker_bindings(self.manifest.breaker_bindings.clone());

        if !self.manifest.noise.is_empty() {
            let seed = engine.settings().noise_seed;
            engine.add_environment(Box::new(NoiseEnvironment::new(
                self.manifest.noise.clone(),
                seed,
            )));
        }

        let mut failures = Vec::new();
        for (id, device) in &self.devices {
            if let Err(e) = apply_device(engine, device, self.scripts.get(id).map(String::as_str)) {
                failures.push(e);
            }
        }
        info!(
            project = %self.manifest.project.id,
            devices = self.devices.len(),
            failed = failures.len(),
            "Project applied"
        );
        failures
    }
}

/// Install one device file; replaces a device with the same id
pub fn apply_device(
    engine: &mut Engine,
    file: &DeviceFile,
    script: Option<&str>,
) -> Result<(), EngineError> {
    let config = &file.device.config;
    let now = engine.now_ms();
    let substation = engine.substation_mut();

    let model = substation.model_mut();
    if !model.has_profile(&config.profile) {
        model.insert_profile(DeviceProfile::new(config.profile.clone()));
    }
    let profile = model.profile_mut(&config.profile);
    if let Some(unit_id) = file.device.unit_id {
        profile.unit_id = Some(unit_id);
    }
    for point in &file.points {
        if let Err(e) = profile.set(point.point_type, point.address, &point.value) {
            warn!(
                device_id = %config.id,
                address = point.address,
                table = %point.point_type,
                error = %e,
                "Skipping point"
            );
        }
    }

    for attribute in &file.attributes {
        substation.write_mms(
            &attribute.path,
            attribute.value.clone(),
            WriteSource::Project,
            now,
        );
    }

    for block in &file.goose {
        substation.register_goose(&block.path, block.config.clone(), block.dataset.clone(), now);
    }

    engine.add_device(config.clone());
    match script {
        Some(source) => engine.load_script(&config.id, source),
        None => Ok(()),
    }
}
