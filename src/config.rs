use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::project::ApprovalType;
use crate::{klog_debug, Error, Result};

/// Default working hours per calendar day for timeline estimates.
pub const DEFAULT_HOURS_PER_DAY: f64 = 8.0;

/// Default per-task side-effect timeout.
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 300;

/// Default cost above which a single task needs sign-off.
pub const DEFAULT_HIGH_COST_THRESHOLD: f64 = 1000.0;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub approval: ApprovalPolicy,
}

/// Scheduling knobs for the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub hours_per_day: f64,
    pub task_timeout_secs: u64,
    /// 0 waits for a human decision indefinitely.
    pub decision_timeout_secs: u64,
    /// Cap on tasks dispatched per round. Unset dispatches the whole ready set.
    pub max_concurrent: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hours_per_day: DEFAULT_HOURS_PER_DAY,
            task_timeout_secs: DEFAULT_TASK_TIMEOUT_SECS,
            decision_timeout_secs: 0,
            max_concurrent: None,
        }
    }
}

impl EngineConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn decision_timeout(&self) -> Option<Duration> {
        (self.decision_timeout_secs > 0).then(|| Duration::from_secs(self.decision_timeout_secs))
    }
}

/// Which tasks and which run milestones need human sign-off.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApprovalPolicy {
    /// Critical-priority tasks need approval.
    pub require_critical: bool,
    /// Tasks whose estimated cost exceeds this need approval.
    pub high_cost_threshold: f64,
    /// A skill with this name marks a task as specialized.
    pub specialized_marker: String,
    /// Further skills that count as specialized (licensed trades).
    pub specialized_skills: Vec<String>,
    /// Skills that mean hiring labor, for the `labor_hire` point.
    pub labor_skills: Vec<String>,
    /// Skills that mean a permit is involved, for the `permit` point.
    pub permit_skills: Vec<String>,
    /// Run-level approval points that are active.
    pub points: Vec<ApprovalType>,
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        let strings = |items: &[&str]| -> Vec<String> {
            items.iter().map(|s| s.to_string()).collect()
        };
        Self {
            require_critical: true,
            high_cost_threshold: DEFAULT_HIGH_COST_THRESHOLD,
            specialized_marker: "specialized".to_string(),
            specialized_skills: strings(&["electrical", "gas", "structural"]),
            labor_skills: strings(&[
                "carpentry",
                "electrical",
                "plumbing",
                "painting",
                "roofing",
                "drywall",
                "tiling",
                "landscaping",
                "general_labor",
            ]),
            permit_skills: strings(&["permit"]),
            points: vec![ApprovalType::Plan, ApprovalType::LaborHire],
        }
    }
}

impl ApprovalPolicy {
    /// A policy with no approval requirements at all.
    pub fn permissive() -> Self {
        Self {
            require_critical: false,
            high_cost_threshold: f64::INFINITY,
            specialized_marker: String::new(),
            specialized_skills: Vec::new(),
            labor_skills: Vec::new(),
            permit_skills: Vec::new(),
            points: Vec::new(),
        }
    }
}

impl Config {
    pub fn keystone_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".keystone"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::keystone_dir()?.join("keystone.toml"))
    }

    /// Load from the default location, falling back to defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        klog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            klog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        klog_debug!(
            "Config loaded: hours_per_day={}, task_timeout_secs={}, points={:?}",
            config.engine.hours_per_day,
            config.engine.task_timeout_secs,
            config.approval.points
        );
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        klog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.engine.hours_per_day > 0.0 && self.engine.hours_per_day <= 24.0) {
            return Err(Error::Validation(format!(
                "engine.hours_per_day must be in (0, 24], got {}",
                self.engine.hours_per_day
            )));
        }
        if self.engine.task_timeout_secs == 0 {
            return Err(Error::Validation(
                "engine.task_timeout_secs must be positive".to_string(),
            ));
        }
        if self.engine.max_concurrent == Some(0) {
            return Err(Error::Validation(
                "engine.max_concurrent must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
