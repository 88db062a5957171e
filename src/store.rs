//! File-backed project store.
//!
//! Projects are stored as pretty-printed JSON. Saves go through a temp file
//! and a rename, keeping the previous version as `<name>.json.bak`.

use std::fs;
use std::path::{Path, PathBuf};

use crate::core::project::Project;
use crate::util::blocking;
use crate::{klog_debug, Result};

pub struct ProjectStore;

impl ProjectStore {
    pub async fn load(path: &Path) -> Result<Project> {
        let path = path.to_path_buf();
        blocking(move || Self::load_sync(&path)).await
    }

    /// Read and validate a project record.
    pub fn load_sync(path: &Path) -> Result<Project> {
        klog_debug!("ProjectStore::load path={}", path.display());
        let contents = fs::read_to_string(path)?;
        let mut project: Project = serde_json::from_str(&contents)?;
        project.validate_record()?;
        if let Some(plan) = project.plan.as_mut() {
            plan.derive_blocks();
        }
        klog_debug!(
            "Project loaded: {} ({} tasks, phase {})",
            project.name,
            project.plan.as_ref().map_or(0, |p| p.tasks.len()),
            project.phase()
        );
        Ok(project)
    }

    pub async fn save(project: &Project, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(project)?;
        let path = path.to_path_buf();
        blocking(move || Self::write_atomic(&path, &contents)).await
    }

    pub fn save_sync(project: &Project, path: &Path) -> Result<()> {
        Self::write_atomic(path, &serde_json::to_string_pretty(project)?)
    }

    fn write_atomic(path: &Path, contents: &str) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        if path.exists() {
            let backup = Self::sibling(path, "bak");
            klog_debug!("Creating project backup: {}", backup.display());
            fs::copy(path, &backup)?;
        }

        let temp = Self::sibling(path, "tmp");
        fs::write(&temp, contents)?;
        fs::rename(&temp, path)?;
        klog_debug!("Project saved: {}", path.display());
        Ok(())
    }

    /// `project.json` -> `project.json.<suffix>`
    fn sibling(path: &Path, suffix: &str) -> PathBuf {
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(".");
        name.push(suffix);
        path.with_file_name(name)
    }
}
