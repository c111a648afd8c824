//! Serializable optimizer state

use std::collections::BTreeMap;

use ndarray::Array1;
use serde::{Deserialize, Serialize};

use super::{iter_params, ParamGroup};
use crate::error::{AmpError, Result};

/// Hyper-parameter overrides and size of one parameter group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupState {
    pub lr: Option<f32>,
    pub weight_decay: Option<f32>,
    pub num_params: usize,
}

/// Optimizer snapshot for checkpoint and resume
///
/// Per-parameter buffers are stored flat, in [`iter_params`] order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDict {
    pub kind: String,
    pub step: u64,
    pub lr: f32,
    pub groups: Vec<GroupState>,
    pub buffers: BTreeMap<String, Vec<Option<Vec<f32>>>>,
}

impl StateDict {
    pub fn new(kind: &str, step: u64, lr: f32, groups: &[ParamGroup]) -> Self {
        let groups = groups
            .iter()
            .map(|g| GroupState { lr: g.lr, weight_decay: g.weight_decay, num_params: g.len() })
            .collect();
        Self { kind: kind.to_string(), step, lr, groups, buffers: BTreeMap::new() }
    }

    pub fn with_buffer(mut self, name: &str, buffer: &[Option<Array1<f32>>]) -> Self {
        let flat = buffer.iter().map(|b| b.as_ref().map(|a| a.to_vec())).collect();
        self.buffers.insert(name.to_string(), flat);
        self
    }

    /// Check kind and group layout against a live optimizer
    pub fn check_compatible(&self, kind: &str, groups: &[ParamGroup]) -> Result<()> {
        if self.kind != kind {
            return Err(AmpError::StateMismatch(format!(
                "state was saved by {}, cannot load into {kind}",
                self.kind
            )));
        }
        let saved: Vec<usize> = self.groups.iter().map(|g| g.num_params).collect();
        let live: Vec<usize> = groups.iter().map(ParamGroup::len).collect();
        if saved != live {
            return Err(AmpError::StateMismatch(format!(
                "group sizes differ: saved {saved:?}, optimizer has {live:?}"
            )));
        }
        Ok(())
    }

    /// Decode a named buffer, checking it against the parameters' sizes
    pub fn buffer(&self, name: &str, groups: &[ParamGroup]) -> Result<Vec<Option<Array1<f32>>>> {
        let flat = self
            .buffers
            .get(name)
            .ok_or_else(|| AmpError::StateMismatch(format!("missing buffer '{name}'")))?;

        let lens: Vec<usize> = iter_params(groups).map(|p| p.len()).collect();
        if flat.len() != lens.len() {
            return Err(AmpError::StateMismatch(format!(
                "buffer '{name}' has {} entries for {} parameters",
                flat.len(),
                lens.len()
            )));
        }

        flat.iter()
            .zip(lens)
            .enumerate()
            .map(|(i, (entry, len))| match entry {
                Some(values) if values.len() != len => Err(AmpError::StateMismatch(format!(
                    "buffer '{name}'[{i}] has {} values, parameter has {len}",
                    values.len()
                ))),
                Some(values) => Ok(Some(Array1::from(values.clone()))),
                None => Ok(None),
            })
            .collect()
    }

    /// Restore group hyper-parameter overrides saved in this state
    pub fn apply_group_overrides(&self, groups: &mut [ParamGroup]) {
        for (group, saved) in groups.iter_mut().zip(&self.groups) {
            group.lr = saved.lr;
            group.weight_decay = saved.weight_decay;
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
