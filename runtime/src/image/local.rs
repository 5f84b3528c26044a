//! Daemon-resident image variant.
//!
//! Reads come from the daemon's image inspect; all mutations are staged in
//! the handle. `save` rewrites an export of the original image (layer splice,
//! labels, added layers) and loads the result back under the save name, so
//! nothing is visible in the daemon until the whole staged set lands.

use std::any::Any;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::OnceCell;

use kiln_core::error::{KilnError, Result};

use crate::docker::{DockerClient, ImageDetails};
use crate::image::{splice_layers, Image};
use crate::tarball;

#[derive(Debug, Clone)]
struct AddedLayer {
    tarball: PathBuf,
    diff_id: String,
}

#[derive(Debug, Clone)]
struct RebasePlan {
    old_top_layer: String,
    new_base_name: String,
}

pub struct LocalImage {
    docker: DockerClient,
    name: String,
    save_name: String,
    details: OnceCell<ImageDetails>,
    staged_labels: HashMap<String, String>,
    added_layers: Vec<AddedLayer>,
    reused_layers: Vec<String>,
    rebase_plan: Option<RebasePlan>,
}

impl LocalImage {
    pub fn new(docker: DockerClient, name: &str) -> Self {
        Self {
            docker,
            name: name.to_string(),
            save_name: name.to_string(),
            details: OnceCell::new(),
            staged_labels: HashMap::new(),
            added_layers: Vec::new(),
            reused_layers: Vec::new(),
            rebase_plan: None,
        }
    }

    async fn details(&self) -> Result<&ImageDetails> {
        self.details
            .get_or_try_init(|| self.docker.inspect(&self.name))
            .await
    }

    /// The layer sequence as it would look after save, bottom to top.
    async fn staged_diff_ids(&self) -> Result<Vec<String>> {
        let mut diff_ids = self.details().await?.diff_ids.clone();
        if let Some(plan) = &self.rebase_plan {
            let base = self.docker.inspect(&plan.new_base_name).await?;
            diff_ids = splice_layers(&self.name, &diff_ids, &plan.old_top_layer, &base.diff_ids)?;
        }
        diff_ids.extend(self.reused_layers.iter().cloned());
        diff_ids.extend(self.added_layers.iter().map(|l| l.diff_id.clone()));
        Ok(diff_ids)
    }

    /// RepoTags entries must be tagged references.
    fn save_tag(&self) -> String {
        let last_segment = self.save_name.rsplit('/').next().unwrap_or(&self.save_name);
        if last_segment.contains(':') {
            self.save_name.clone()
        } else {
            format!("{}:latest", self.save_name)
        }
    }
}

#[async_trait]
impl Image for LocalImage {
    fn name(&self) -> &str {
        &self.name
    }

    fn rename(&mut self, name: &str) {
        self.save_name = name.to_string();
    }

    async fn label(&self, key: &str) -> Result<String> {
        if let Some(value) = self.staged_labels.get(key) {
            return Ok(value.clone());
        }
        let details = self.details().await?;
        Ok(details.labels.get(key).cloned().unwrap_or_default())
    }

    fn set_label(&mut self, key: &str, value: &str) -> Result<()> {
        self.staged_labels.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn add_layer(&mut self, tarball: &Path) -> Result<()> {
        let diff_id = crate::tarball::diff_id_of(tarball)?;
        self.added_layers.push(AddedLayer {
            tarball: tarball.to_path_buf(),
            diff_id,
        });
        Ok(())
    }

    async fn reuse_layer(&mut self, layer_id: &str) -> Result<()> {
        let details = self.details().await?;
        if !details.diff_ids.iter().any(|d| d == layer_id) {
            return Err(KilnError::Docker(format!(
                "image '{}' has no layer '{layer_id}' to reuse",
                self.name
            )));
        }
        self.reused_layers.push(layer_id.to_string());
        Ok(())
    }

    async fn top_layer(&self) -> Result<String> {
        self.staged_diff_ids()
            .await?
            .last()
            .cloned()
            .ok_or_else(|| KilnError::Docker(format!("image '{}' has no layers", self.name)))
    }

    async fn digest(&self) -> Result<String> {
        let details = self.details().await?;
        match details.repo_digests.first() {
            Some(repo_digest) => Ok(repo_digest
                .rsplit('@')
                .next()
                .unwrap_or(repo_digest)
                .to_string()),
            None => Ok(details.id.clone()),
        }
    }

    async fn rebase(&mut self, old_top_layer: &str, new_base: &dyn Image) -> Result<()> {
        let new_base = new_base
            .as_any()
            .downcast_ref::<LocalImage>()
            .ok_or_else(|| {
                KilnError::Docker("rebase base image must also be daemon-resident".to_string())
            })?;

        // fail early when the recorded top layer is not in this image
        let details = self.details().await?;
        splice_layers(&self.name, &details.diff_ids, old_top_layer, &[])?;

        self.rebase_plan = Some(RebasePlan {
            old_top_layer: old_top_layer.to_string(),
            new_base_name: new_base.name().to_string(),
        });
        Ok(())
    }

    async fn save(&mut self) -> Result<String> {
        let scratch = tempfile::tempdir()?;

        let export_path = scratch.path().join("image.tar");
        self.docker.export_image(&self.name, &export_path).await?;
        let exported = tarball::ExportedImage::unpack(&export_path, &scratch.path().join("image"))?;

        let mut config = exported.config.clone();
        let mut diff_ids = exported.diff_ids()?;
        let mut layer_paths = exported.layer_paths.clone();

        if let Some(plan) = &self.rebase_plan {
            let base_export = scratch.path().join("base.tar");
            self.docker
                .export_image(&plan.new_base_name, &base_export)
                .await?;
            let base =
                tarball::ExportedImage::unpack(&base_export, &scratch.path().join("base"))?;
            let base_diff_ids = base.diff_ids()?;

            let cut = diff_ids
                .iter()
                .position(|d| d == &plan.old_top_layer)
                .ok_or_else(|| KilnError::CorruptMetadata {
                    image: self.name.clone(),
                    message: format!(
                        "recorded base top layer '{}' not present in image",
                        plan.old_top_layer
                    ),
                })?;

            let mut spliced_paths = base.layer_paths.clone();
            spliced_paths.extend_from_slice(&layer_paths[cut + 1..]);
            layer_paths = spliced_paths;
            diff_ids = splice_layers(&self.name, &diff_ids, &plan.old_top_layer, &base_diff_ids)?;
        }

        for reused in &self.reused_layers {
            let idx = exported
                .diff_ids()?
                .iter()
                .position(|d| d == reused)
                .ok_or_else(|| {
                    KilnError::Docker(format!(
                        "image '{}' has no layer '{reused}' to reuse",
                        self.name
                    ))
                })?;
            layer_paths.push(exported.layer_paths[idx].clone());
            diff_ids.push(reused.clone());
        }

        for (i, added) in self.added_layers.iter().enumerate() {
            let raw = scratch.path().join(format!("added-{i}.tar"));
            tarball::gunzip(&added.tarball, &raw)?;
            layer_paths.push(raw);
            diff_ids.push(added.diff_id.clone());
        }

        config["rootfs"]["diff_ids"] = serde_json::json!(diff_ids);
        if !self.staged_labels.is_empty() {
            let labels = &mut config["config"]["Labels"];
            if labels.is_null() {
                *labels = serde_json::json!({});
            }
            for (key, value) in &self.staged_labels {
                labels[key] = serde_json::json!(value);
            }
        }
        // history entries no longer line up with the spliced layer sequence
        if let Some(obj) = config.as_object_mut() {
            obj.remove("history");
        }

        let out = scratch.path().join("out.tar");
        tarball::assemble(&config, &layer_paths, &self.save_tag(), &out)?;
        self.docker.load_image(&out).await?;

        self.staged_labels.clear();
        self.added_layers.clear();
        self.reused_layers.clear();
        self.rebase_plan = None;
        self.details = OnceCell::new();

        let saved = self.docker.inspect(&self.save_name).await?;
        match saved.repo_digests.first() {
            Some(repo_digest) => Ok(repo_digest
                .rsplit('@')
                .next()
                .unwrap_or(repo_digest)
                .to_string()),
            None => Ok(saved.id),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
