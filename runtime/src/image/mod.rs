//! The image abstraction.
//!
//! One capability set, two backing variants: [`LocalImage`] lives in the
//! daemon, [`RemoteImage`] lives in a registry and never needs a daemon.
//! Every mutation (labels, layers, rename, rebase) is staged in the handle
//! and only lands in the backing store on [`Image::save`]. Each handle owns
//! its staged state exclusively; handles are never shared across tasks.

mod local;
mod remote;

pub use local::LocalImage;
pub use remote::{RegistryAuth, RemoteImage};

use std::any::Any;
use std::path::Path;

use async_trait::async_trait;

use kiln_core::error::{KilnError, Result};

use crate::docker::DockerClient;

/// Capability set shared by the Local and Remote variants.
#[async_trait]
pub trait Image: Send + Sync {
    /// The reference this handle was constructed with. Stable across
    /// [`Image::rename`].
    fn name(&self) -> &str;

    /// Change the save target. No effect on the backing store until `save`.
    fn rename(&mut self, name: &str);

    /// Read a label. A label absent on an existing image is `Ok("")`;
    /// a missing image is an error.
    async fn label(&self, key: &str) -> Result<String>;

    /// Stage a label mutation.
    fn set_label(&mut self, key: &str, value: &str) -> Result<()>;

    /// Stage a new layer from a gzipped tarball on disk.
    async fn add_layer(&mut self, tarball: &Path) -> Result<()>;

    /// Stage re-attachment of an existing layer by id, without re-reading
    /// its content.
    async fn reuse_layer(&mut self, layer_id: &str) -> Result<()>;

    /// Identifier of the most recently applied layer, staged view.
    async fn top_layer(&self) -> Result<String>;

    /// Content digest of the image. For the remote variant this reflects the
    /// manifest that was (or would be) pushed; for the local variant, the
    /// daemon's view.
    async fn digest(&self) -> Result<String>;

    /// Stage a rebase: every layer at or below `old_top_layer` is replaced
    /// by `new_base`'s full layer sequence; the layers above it are kept in
    /// their original order. The new base must share this handle's backing
    /// variant.
    async fn rebase(&mut self, old_top_layer: &str, new_base: &dyn Image) -> Result<()>;

    /// Commit all staged mutations to the backing store. From the caller's
    /// point of view either everything lands or nothing does. Returns the
    /// digest of the saved image.
    async fn save(&mut self) -> Result<String>;

    /// Variant downcast hook for `rebase`.
    fn as_any(&self) -> &dyn Any;
}

/// Constructs image handles in either backing variant.
pub struct ImageFactory {
    docker: DockerClient,
    auth: RegistryAuth,
}

impl ImageFactory {
    pub fn new(docker: DockerClient) -> Self {
        Self {
            docker,
            auth: RegistryAuth::from_env(),
        }
    }

    /// A daemon-resident handle, optionally pulled before first use.
    pub async fn new_local(&self, name: &str, pull: bool) -> Result<Box<dyn Image>> {
        if pull {
            self.docker.pull(name).await?;
        }
        Ok(Box::new(LocalImage::new(self.docker.clone(), name)))
    }

    /// A registry-resident handle; no daemon round-trips.
    pub fn new_remote(&self, name: &str) -> Result<Box<dyn Image>> {
        Ok(Box::new(RemoteImage::new(name, self.auth.clone())?))
    }
}

/// Replace the prefix of `current` up to and including `old_top` with `base`,
/// keeping everything above `old_top` in order. Layer sequences are bottom
/// to top.
pub(crate) fn splice_layers(
    image: &str,
    current: &[String],
    old_top: &str,
    base: &[String],
) -> Result<Vec<String>> {
    let cut = current
        .iter()
        .position(|layer| layer == old_top)
        .ok_or_else(|| KilnError::CorruptMetadata {
            image: image.to_string(),
            message: format!("recorded base top layer '{old_top}' not present in image"),
        })?;
    let mut spliced = base.to_vec();
    spliced.extend_from_slice(&current[cut + 1..]);
    Ok(spliced)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_splice_replaces_base_prefix() {
        let spliced = splice_layers(
            "myorg/app",
            &ids(&["b1", "b2", "a1", "a2"]),
            "b2",
            &ids(&["n1", "n2", "n3"]),
        )
        .unwrap();
        assert_eq!(spliced, ids(&["n1", "n2", "n3", "a1", "a2"]));
    }

    #[test]
    fn test_splice_preserves_app_layer_order() {
        let spliced = splice_layers(
            "myorg/app",
            &ids(&["b1", "a1", "a2", "a3"]),
            "b1",
            &ids(&["n1"]),
        )
        .unwrap();
        assert_eq!(spliced, ids(&["n1", "a1", "a2", "a3"]));
    }

    #[test]
    fn test_splice_old_top_at_top_drops_everything_below() {
        let spliced = splice_layers("myorg/app", &ids(&["b1", "b2"]), "b2", &ids(&["n1"])).unwrap();
        assert_eq!(spliced, ids(&["n1"]));
    }

    #[test]
    fn test_splice_unknown_old_top_is_corrupt_metadata() {
        let err = splice_layers("myorg/app", &ids(&["b1", "a1"]), "zz", &ids(&["n1"])).unwrap_err();
        assert!(matches!(err, KilnError::CorruptMetadata { .. }));
        assert!(err.to_string().contains("myorg/app"));
    }
}
