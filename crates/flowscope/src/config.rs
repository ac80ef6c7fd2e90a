//! Session configuration.

use std::collections::BTreeMap;

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

use crate::env;
use crate::placement::Resource;
use crate::scope::AttrValue;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Run ops immediately instead of recording them for later compilation.
    pub eager_execution: bool,
    pub machine_num: usize,
    /// CPU devices per node. Derived from the GPU count when unset.
    pub cpu_device_num: Option<usize>,
    pub num_process_per_node: usize,
    /// Attributes every scope carries, with their default values. `scope_config` may only
    /// override attributes listed here.
    pub scope_attr_defaults: BTreeMap<String, AttrValue>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            eager_execution: false,
            machine_num: 1,
            cpu_device_num: None,
            num_process_per_node: 1,
            scope_attr_defaults: BTreeMap::new(),
        }
    }
}

impl SessionConfig {
    pub fn eager() -> Self {
        SessionConfig {
            eager_execution: true,
            ..Self::default()
        }
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: SessionConfig =
            serde_json::from_str(raw).context("failed to parse session config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.machine_num > 0, "machine_num must be positive");
        ensure!(
            self.num_process_per_node > 0,
            "num_process_per_node must be positive"
        );
        if let Some(cpu_device_num) = self.cpu_device_num {
            ensure!(cpu_device_num > 0, "cpu_device_num must be positive when set");
        }
        Ok(())
    }

    /// Applies `FLOWSCOPE_EAGER` and `FLOWSCOPE_MACHINE_NUM` when they are set.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(env::eager_override(), env::machine_num_override())
    }

    fn with_overrides(mut self, eager: Option<bool>, machine_num: Option<usize>) -> Self {
        if let Some(eager) = eager {
            self.eager_execution = eager;
        }
        if let Some(machine_num) = machine_num {
            self.machine_num = machine_num;
        }
        self
    }

    pub fn scope_attr(mut self, name: impl Into<String>, default: impl Into<AttrValue>) -> Self {
        self.scope_attr_defaults.insert(name.into(), default.into());
        self
    }

    /// Devices available to a session whose engine reports `gpu_device_num` GPUs per node.
    ///
    /// Without GPUs each process gets one CPU device; with GPUs the CPU count mirrors them.
    pub fn resource(&self, gpu_device_num: usize) -> Resource {
        let cpu_device_num = self.cpu_device_num.unwrap_or(if gpu_device_num == 0 {
            self.num_process_per_node
        } else {
            gpu_device_num
        });
        Resource {
            machine_num: self.machine_num,
            gpu_device_num,
            cpu_device_num,
        }
    }
}
