//! Image processing task envelope.

use serde::{Deserialize, Serialize};

use crate::error::TaskError;

/// One product's pending image batch, as published when the product is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageTask {
    /// Product whose images are being processed.
    pub product_id: u64,

    /// Source image locators, in the order the compressed list must follow.
    pub images: Vec<String>,
}

impl ImageTask {
    /// Creates a new task.
    pub fn new(product_id: u64, images: Vec<String>) -> Self {
        Self { product_id, images }
    }

    /// Decodes and validates a wire payload.
    pub fn decode(payload: &[u8]) -> Result<Self, TaskError> {
        let task: ImageTask =
            serde_json::from_slice(payload).map_err(|e| TaskError::Malformed(e.to_string()))?;
        task.validate()?;
        Ok(task)
    }

    /// Serializes the task to its wire form.
    pub fn encode(&self) -> Result<Vec<u8>, TaskError> {
        self.validate()?;
        serde_json::to_vec(self).map_err(|e| TaskError::Malformed(e.to_string()))
    }

    fn validate(&self) -> Result<(), TaskError> {
        if self.images.is_empty() {
            return Err(TaskError::NoImages {
                product_id: self.product_id,
            });
        }

        if let Some(index) = self.images.iter().position(|url| url.trim().is_empty()) {
            return Err(TaskError::EmptyLocator {
                product_id: self.product_id,
                index,
            });
        }

        Ok(())
    }
}

/// Best-effort extraction of the product id from a payload that failed to decode.
///
/// Only used to label dead-letter records; returns `None` for anything that is not
/// a JSON object with an unsigned `product_id`.
pub fn product_id_hint(payload: &[u8]) -> Option<u64> {
    serde_json::from_slice::<serde_json::Value>(payload)
        .ok()?
        .get("product_id")?
        .as_u64()
}
