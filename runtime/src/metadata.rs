//! Build metadata embedded in app images.
//!
//! The build pipeline stamps every app image with a JSON label describing,
//! among other things, the run image the app layers sit on. Rebase rewrites
//! exactly that substructure; everything else the pipeline wrote must survive
//! a decode → encode round-trip untouched, so both structs carry a flattened
//! side table for the fields kiln does not model.

use serde::{Deserialize, Serialize};

use kiln_core::error::{KilnError, Result};

/// Label carrying the stack identifier on built images.
pub const STACK_ID_LABEL: &str = "io.buildpacks.stack.id";

/// Label carrying the JSON-encoded [`AppImageMetadata`].
pub const METADATA_LABEL: &str = "io.buildpacks.lifecycle.metadata";

/// Decoded content of the metadata label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppImageMetadata {
    #[serde(rename = "runImage")]
    pub run_image: RunImageMetadata,

    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

/// The base the app layers were built on.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunImageMetadata {
    #[serde(default)]
    pub sha: String,

    #[serde(rename = "topLayer", default)]
    pub top_layer: String,

    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

impl AppImageMetadata {
    /// Decode the label value. The error names the image the label came from.
    pub fn from_label(image: &str, raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| KilnError::CorruptMetadata {
            image: image.to_string(),
            message: e.to_string(),
        })
    }

    /// Re-encode for writing back to the label.
    pub fn to_label(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
