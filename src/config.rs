use std::fs;

use serde::{Serialize, Deserialize};
use tch::Device;

use crate::error::Result;
use crate::schedulers::{DdimDiffuser, DdimDiffuserConfig, NoiseScheduleKind};

/// Everything needed to build a ready-to-use diffuser.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiffusionConfig {
    #[serde(default)]
    pub schedule: NoiseScheduleKind,
    #[serde(default)]
    pub sampler: DdimDiffuserConfig,
}

impl DiffusionConfig {
    pub fn from_file<T: AsRef<std::path::Path>>(path: T) -> Result<Self> {
        let file = fs::read_to_string(path)?;
        let cfg: DiffusionConfig = toml::from_str(&file)?;
        Ok(cfg)
    }

    pub fn build(&self, device: Device) -> Result<DdimDiffuser> {
        let schedule = self.schedule.build(device)?;
        DdimDiffuser::new(schedule, self.sampler)
    }
}
