//! Crawl configuration: region list plus the adaptive-search tunables.
//!
//! Config files may be YAML or JSON; a missing file falls back to one
//! built-in default region so a first run works out of the box.

use crate::error::{CrawlError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Hard ceiling on external API calls per run; `--max-calls` is clamped to it.
pub const HARD_MAX_CALLS: i64 = 4000;

/// Convert a seconds flag to a `Duration`, rejecting the values
/// `Duration::from_secs_f64` would panic on.
pub fn duration_from_secs(value: f64, flag: &str) -> Result<Duration> {
    if !value.is_finite() || value < 0.0 {
        return Err(CrawlError::Config(format!(
            "{} must be a non-negative number",
            flag
        )));
    }
    Ok(Duration::from_secs_f64(value))
}

fn default_initial_radius() -> f64 {
    100.0
}

fn default_min_radius() -> f64 {
    35.0
}

fn default_overlap_step_ratio() -> f64 {
    0.7
}

fn default_saturation_threshold() -> usize {
    18
}

fn default_split_overlap_factor() -> f64 {
    0.8
}

/// One search region: a bounding box plus the radius policy that controls
/// how it is tiled and how far cells may be subdivided.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionConfig {
    #[serde(default)]
    pub name: String,

    /// `[sw_lat, sw_lng, ne_lat, ne_lng]`
    pub bbox: [f64; 4],

    #[serde(default = "default_initial_radius")]
    pub initial_radius_m: f64,

    #[serde(default = "default_min_radius")]
    pub min_radius_m: f64,

    /// Fraction of the initial radius used as the grid step; values below 1
    /// make adjacent cells overlap.
    #[serde(default = "default_overlap_step_ratio")]
    pub overlap_step_ratio: f64,
}

impl RegionConfig {
    pub fn sw_lat(&self) -> f64 {
        self.bbox[0]
    }

    pub fn sw_lng(&self) -> f64 {
        self.bbox[1]
    }

    pub fn ne_lat(&self) -> f64 {
        self.bbox[2]
    }

    pub fn ne_lng(&self) -> f64 {
        self.bbox[3]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlConfig {
    pub regions: Vec<RegionConfig>,

    /// Result count at or above which a cell is considered saturated.
    #[serde(default = "default_saturation_threshold")]
    pub saturation_threshold: usize,

    /// Diagonal offset of split children, as a fraction of the child radius.
    #[serde(default = "default_split_overlap_factor")]
    pub split_overlap_factor: f64,
}

impl CrawlConfig {
    /// Load from YAML or JSON. JSON is tried first so a JSON-formatted file
    /// never depends on YAML parsing quirks.
    pub fn load(path: &Path) -> Result<CrawlConfig> {
        if !path.exists() {
            warn!(
                "Config not found at {}, using built-in default region",
                path.display()
            );
            return Ok(Self::default_config());
        }

        let raw = std::fs::read_to_string(path)?;
        let mut config: CrawlConfig = match serde_json::from_str(&raw) {
            Ok(config) => config,
            Err(_) => serde_yaml::from_str(&raw)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn default_config() -> CrawlConfig {
        CrawlConfig {
            regions: vec![RegionConfig {
                name: "mission_sf".to_string(),
                bbox: [
                    37.74802895624222,
                    -122.42248265700066,
                    37.769249996806195,
                    -122.40801467343661,
                ],
                initial_radius_m: 100.0,
                min_radius_m: 35.0,
                overlap_step_ratio: 0.7,
            }],
            saturation_threshold: default_saturation_threshold(),
            split_overlap_factor: default_split_overlap_factor(),
        }
    }

    pub fn validate(&mut self) -> Result<()> {
        if self.regions.is_empty() {
            return Err(CrawlError::Config(
                "config must define a non-empty 'regions' list".to_string(),
            ));
        }
        if self.saturation_threshold < 1 {
            return Err(CrawlError::Config(
                "saturation_threshold must be >= 1".to_string(),
            ));
        }
        if self.split_overlap_factor <= 0.0 {
            return Err(CrawlError::Config(
                "split_overlap_factor must be > 0".to_string(),
            ));
        }

        for (i, region) in self.regions.iter_mut().enumerate() {
            if region.name.is_empty() {
                region.name = format!("region_{}", i + 1);
            }
            let name = &region.name;

            if region.sw_lat() >= region.ne_lat() || region.sw_lng() >= region.ne_lng() {
                return Err(CrawlError::Config(format!(
                    "region '{}' has invalid bbox ordering",
                    name
                )));
            }
            if region.initial_radius_m <= 0.0 || region.min_radius_m <= 0.0 {
                return Err(CrawlError::Config(format!(
                    "region '{}' radii must be > 0",
                    name
                )));
            }
            if region.min_radius_m > region.initial_radius_m {
                return Err(CrawlError::Config(format!(
                    "region '{}' min_radius_m cannot exceed initial_radius_m",
                    name
                )));
            }
            if region.overlap_step_ratio <= 0.0 || region.overlap_step_ratio > 1.5 {
                return Err(CrawlError::Config(format!(
                    "region '{}' overlap_step_ratio must be in (0, 1.5]",
                    name
                )));
            }
        }

        Ok(())
    }
}
