//! Project File Watcher
//!
//! Watches project files and hot-reloads scripts and devices into the
//! running engine.

use std::path::{Path, PathBuf};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::fs;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::config::Project;
use super::loader::{ProjectLoader, apply_device};
use crate::engine::SharedEngine;

/// File change event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileChange {
    /// A device file was modified
    DeviceChanged(String),
    /// A script was modified; path relative to the project root
    ScriptChanged(PathBuf),
    /// The project manifest or an IED model was modified
    RestartRequired(PathBuf),
}

/// Project file watcher
pub struct ProjectWatcher {
    project: Project,
    engine: SharedEngine,
    rx: mpsc::Receiver<FileChange>,
    /// The underlying watcher (kept alive)
    _watcher: RecommendedWatcher,
}

impl ProjectWatcher {
    /// Create a new project watcher
    pub fn new(project: Project, engine: SharedEngine) -> Result<Self, notify::Error> {
        // Canonicalize the path to get absolute path for reliable comparison
        let project_path = project
            .path
            .canonicalize()
            .unwrap_or_else(|_| project.path.clone());
        let (tx, rx) = mpsc::channel(100);

        let project_path_clone = project_path.clone();
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    if let Some(change) = Self::event_to_change(&project_path_clone, &event) {
                        let _ = tx.blocking_send(change);
                    }
                }
                Err(e) => {
                    error!("File watcher error: {}", e);
                }
            }
        })?;

        watcher.watch(&project_path, RecursiveMode::Recursive)?;
        info!("Watching project directory: {}", project_path.display());

        Ok(Self {
            project: Project {
                path: project_path,
                ..project
            },
            engine,
            rx,
            _watcher: watcher,
        })
    }

    /// Convert a notify event to our FileChange type
    fn event_to_change(project_path: &Path, event: &Event) -> Option<FileChange> {
        match event.kind {
            EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_) => {}
            _ => return None,
        }

        let path = event.paths.first()?;
        let rel_path = path.strip_prefix(project_path).ok()?;
        let rel_str = rel_path.to_string_lossy();

        if rel_str.starts_with("devices/") && rel_str.ends_with(".device.toml") {
            let filename = rel_path.file_stem()?.to_string_lossy();
            let device_id = filename.strip_suffix(".device")?;
            Some(FileChange::DeviceChanged(device_id.to_string()))
        } else if rel_str.ends_with(".st") {
            Some(FileChange::ScriptChanged(rel_path.to_path_buf()))
        } else if rel_str == "project.toml"
            || (rel_str.starts_with("ied/") && rel_str.ends_with(".json"))
        {
            Some(FileChange::RestartRequired(rel_path.to_path_buf()))
        } else {
            None
        }
    }

    /// Run the watcher loop
    pub async fn run(mut self) {
        info!("Starting file watcher loop");

        while let Some(change) = self.rx.recv().await {
            self.handle_change(change).await;
        }

        info!("File watcher loop ended");
    }

    async fn handle_change(&mut self, change: FileChange) {
        debug!(?change, "File change");
        match change {
            FileChange::ScriptChanged(relative) => self.reload_script(&relative).await,
            FileChange::DeviceChanged(device_id) => self.reload_device(&device_id).await,
            FileChange::RestartRequired(relative) => {
                warn!(path = %relative.display(), "Changed; restart to apply");
            }
        }
    }

    /// Recompile every device using the script; a failed compile keeps the
    /// previous program
    async fn reload_script(&mut self, relative: &Path) {
        let devices: Vec<String> = self
            .project
            .devices_using_script(relative)
            .map(String::from)
            .collect();
        if devices.is_empty() {
            debug!(path = %relative.display(), "Script not used by any device");
            return;
        }

        let source = match fs::read_to_string(self.project.path.join(relative)).await {
            Ok(source) => source,
            Err(e) => {
                warn!(path = %relative.display(), error = %e, "Failed to read script");
                return;
            }
        };

        let mut engine = self.engine.lock();
        for device_id in devices {
            match engine.load_script(&device_id, &source) {
                Ok(()) => {
                    info!(%device_id, "Script reloaded");
                    self.project.scripts.insert(device_id, source.clone());
                }
                Err(e) => error!(%device_id, error = %e, "Script reload failed"),
            }
        }
    }

    async fn reload_device(&mut self, device_id: &str) {
        match ProjectLoader::reload_device(&self.project.path, device_id).await {
            Ok(Some((device, script))) => {
                {
                    let mut engine = self.engine.lock();
                    if let Err(e) = apply_device(&mut engine, &device, script.as_deref()) {
                        error!(%device_id, error = %e, "Device reloaded without its script");
                    } else {
                        info!(%device_id, "Device reloaded");
                    }
                }
                if let Some(script) = script {
                    self.project.scripts.insert(device_id.to_string(), script);
                }
                self.project.devices.insert(device_id.to_string(), device);
            }
            Ok(None) => {
                if let Err(e) = self.engine.lock().remove_device(device_id) {
                    debug!(%device_id, error = %e, "Deleted device was not loaded");
                } else {
                    info!(%device_id, "Device removed");
                }
                self.project.devices.remove(device_id);
                self.project.scripts.remove(device_id);
            }
            Err(e) => {
                warn!("Failed to reload device {}: {}", device_id, e);
            }
        }
    }
}
