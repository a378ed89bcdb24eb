use serde::{Deserialize, Serialize};

use super::VarMeta;

/// The mode tag of a message travelling to the next pipeline stage.
pub const FORWARD: &str = "forward";

/// The mode tag of a message travelling back to the previous pipeline stage.
pub const BACKWARD: &str = "backward";

/// The addressing metadata of a `VarBatch`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchHeader {
    /// The logical channel, routes the batch to a registered handler.
    pub channel: String,
    pub trainer_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mini_batch_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub micro_batch_id: Option<u64>,
    pub mode: String,
    #[serde(default)]
    pub vars: Vec<VarMeta>,
}

impl BatchHeader {
    /// Creates a header addressed to the root scope in `forward` mode.
    ///
    /// # Arguments
    /// * `channel` - The logical channel name.
    /// * `trainer_id` - The id of the sending trainer.
    pub fn new(channel: impl Into<String>, trainer_id: u32) -> Self {
        Self {
            channel: channel.into(),
            trainer_id,
            mini_batch_id: None,
            micro_batch_id: None,
            mode: FORWARD.to_string(),
            vars: Vec::new(),
        }
    }

    /// Addresses the header to a mini-batch scope.
    pub fn with_mini_batch(mut self, id: u64) -> Self {
        self.mini_batch_id = Some(id);
        self
    }

    /// Addresses the header to a micro-batch scope.
    pub fn with_micro_batch(mut self, id: u64) -> Self {
        self.micro_batch_id = Some(id);
        self
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = mode.into();
        self
    }

    /// Creates the header of a reply to this one: same addressing, no variables.
    pub fn reply(&self) -> Self {
        Self {
            vars: Vec::new(),
            ..self.clone()
        }
    }
}
