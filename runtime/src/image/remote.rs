//! Registry-resident image variant.
//!
//! Backed by `oci-distribution`; reads and writes go straight to the
//! registry, never through a daemon. The manifest, config, and layers are
//! fetched once on first read; `save` pushes the staged result (spliced
//! layers, rewritten config, fresh manifest) to the save-name reference.

use std::any::Any;
use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use oci_distribution::client::{Client, ClientConfig, ClientProtocol, Config, ImageLayer};
use oci_distribution::manifest::{self, OciImageManifest};
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::Reference;
use tokio::sync::OnceCell;

use kiln_core::error::{KilnError, Result};

use crate::image::{splice_layers, Image};
use crate::tarball;

/// Authentication credentials for a container registry.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    /// No credentials.
    pub fn anonymous() -> Self {
        Self {
            username: None,
            password: None,
        }
    }

    /// Basic authentication.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Read `REGISTRY_USERNAME` / `REGISTRY_PASSWORD`, falling back to
    /// anonymous when either is unset.
    pub fn from_env() -> Self {
        let username = std::env::var("REGISTRY_USERNAME").ok();
        let password = std::env::var("REGISTRY_PASSWORD").ok();
        if username.is_some() && password.is_some() {
            Self { username, password }
        } else {
            Self::anonymous()
        }
    }

    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

#[derive(Clone)]
struct RemoteState {
    config: serde_json::Value,
    config_media_type: String,
    layers: Vec<ImageLayer>,
    /// Layer blob digests in manifest order, bottom to top.
    layer_digests: Vec<String>,
    /// Manifest digest as reported by the registry.
    digest: String,
}

#[derive(Clone)]
struct RemoteRebase {
    old_top_layer: String,
    base_layers: Vec<ImageLayer>,
    base_layer_digests: Vec<String>,
    base_diff_ids: Vec<String>,
}

pub struct RemoteImage {
    client: Client,
    auth: RegistryAuth,
    name: String,
    save_name: String,
    reference: Reference,
    state: OnceCell<RemoteState>,
    staged_labels: HashMap<String, String>,
    added_layers: Vec<(ImageLayer, String)>,
    reused_layers: Vec<String>,
    rebase_plan: Option<RemoteRebase>,
    saved_digest: Option<String>,
}

impl RemoteImage {
    pub fn new(name: &str, auth: RegistryAuth) -> Result<Self> {
        let reference =
            name.parse::<Reference>()
                .map_err(|e| KilnError::InvalidReference {
                    reference: name.to_string(),
                    message: e.to_string(),
                })?;
        let client = Client::new(ClientConfig {
            protocol: ClientProtocol::Https,
            ..Default::default()
        });
        Ok(Self {
            client,
            auth,
            name: name.to_string(),
            save_name: name.to_string(),
            reference,
            state: OnceCell::new(),
            staged_labels: HashMap::new(),
            added_layers: Vec::new(),
            reused_layers: Vec::new(),
            rebase_plan: None,
            saved_digest: None,
        })
    }

    async fn state(&self) -> Result<&RemoteState> {
        self.state
            .get_or_try_init(|| async {
                let image = self
                    .client
                    .pull(
                        &self.reference,
                        &self.auth.to_oci_auth(),
                        vec![
                            manifest::IMAGE_LAYER_GZIP_MEDIA_TYPE,
                            manifest::IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE,
                            manifest::IMAGE_LAYER_MEDIA_TYPE,
                        ],
                    )
                    .await
                    .map_err(|e| pull_error(&self.name, &self.reference, e))?;

                let config: serde_json::Value = serde_json::from_slice(&image.config.data)?;
                let (layer_digests, config_media_type) = match &image.manifest {
                    Some(m) => (
                        m.layers.iter().map(|l| l.digest.clone()).collect(),
                        m.config.media_type.clone(),
                    ),
                    None => (
                        image
                            .layers
                            .iter()
                            .map(|l| tarball::sha256_digest(&l.data))
                            .collect(),
                        image.config.media_type.clone(),
                    ),
                };

                Ok(RemoteState {
                    config,
                    config_media_type,
                    layer_digests,
                    layers: image.layers,
                    digest: image.digest.unwrap_or_default(),
                })
            })
            .await
    }

    /// The layer digest sequence as it would look after save.
    async fn staged_layer_digests(&self) -> Result<Vec<String>> {
        let state = self.state().await?;
        let mut digests = state.layer_digests.clone();
        if let Some(plan) = &self.rebase_plan {
            digests = splice_layers(
                &self.name,
                &digests,
                &plan.old_top_layer,
                &plan.base_layer_digests,
            )?;
        }
        digests.extend(self.reused_layers.iter().cloned());
        digests.extend(
            self.added_layers
                .iter()
                .map(|(layer, _)| tarball::sha256_digest(&layer.data)),
        );
        Ok(digests)
    }
}

fn pull_error(name: &str, reference: &Reference, err: oci_distribution::errors::OciDistributionError) -> KilnError {
    let message = err.to_string();
    if message.contains("404")
        || message.contains("not found")
        || message.contains("manifest unknown")
    {
        KilnError::ImageNotFound(name.to_string())
    } else {
        KilnError::registry(reference.registry(), message)
    }
}

#[async_trait]
impl Image for RemoteImage {
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
        let state = self.state().await?;
        Ok(state.config["config"]["Labels"][key]
            .as_str()
            .unwrap_or_default()
            .to_string())
    }

    fn set_label(&mut self, key: &str, value: &str) -> Result<()> {
        self.staged_labels.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn add_layer(&mut self, tarball_path: &Path) -> Result<()> {
        let diff_id = tarball::diff_id_of(tarball_path)?;
        let data = std::fs::read(tarball_path)?;
        let layer = ImageLayer::new(
            data,
            manifest::IMAGE_LAYER_GZIP_MEDIA_TYPE.to_string(),
            None,
        );
        self.added_layers.push((layer, diff_id));
        Ok(())
    }

    async fn reuse_layer(&mut self, layer_id: &str) -> Result<()> {
        let state = self.state().await?;
        if !state.layer_digests.iter().any(|d| d == layer_id) {
            return Err(KilnError::registry(
                self.reference.registry(),
                format!("image '{}' has no layer '{layer_id}' to reuse", self.name),
            ));
        }
        self.reused_layers.push(layer_id.to_string());
        Ok(())
    }

    async fn top_layer(&self) -> Result<String> {
        self.staged_layer_digests()
            .await?
            .last()
            .cloned()
            .ok_or_else(|| {
                KilnError::registry(
                    self.reference.registry(),
                    format!("image '{}' has no layers", self.name),
                )
            })
    }

    async fn digest(&self) -> Result<String> {
        if let Some(digest) = &self.saved_digest {
            return Ok(digest.clone());
        }
        let state = self.state().await?;
        if state.digest.is_empty() {
            return Err(KilnError::registry(
                self.reference.registry(),
                format!("registry reported no digest for image '{}'", self.name),
            ));
        }
        Ok(state.digest.clone())
    }

    async fn rebase(&mut self, old_top_layer: &str, new_base: &dyn Image) -> Result<()> {
        let new_base = new_base
            .as_any()
            .downcast_ref::<RemoteImage>()
            .ok_or_else(|| {
                KilnError::registry(
                    self.reference.registry(),
                    "rebase base image must also be registry-resident".to_string(),
                )
            })?;

        let base_state = new_base.state().await?.clone();
        let base_diff_ids = diff_ids_of(&base_state.config)?;

        // fail early when the recorded top layer is not in this image
        let state = self.state().await?;
        splice_layers(&self.name, &state.layer_digests, old_top_layer, &[])?;

        self.rebase_plan = Some(RemoteRebase {
            old_top_layer: old_top_layer.to_string(),
            base_layers: base_state.layers,
            base_layer_digests: base_state.layer_digests,
            base_diff_ids,
        });
        Ok(())
    }

    async fn save(&mut self) -> Result<String> {
        let state = self.state().await?.clone();

        let mut layers = state.layers;
        let mut layer_digests = state.layer_digests;
        let mut config = state.config;
        let mut diff_ids = diff_ids_of(&config)?;

        if let Some(plan) = &self.rebase_plan {
            let cut = layer_digests
                .iter()
                .position(|d| d == &plan.old_top_layer)
                .ok_or_else(|| KilnError::CorruptMetadata {
                    image: self.name.clone(),
                    message: format!(
                        "recorded base top layer '{}' not present in image",
                        plan.old_top_layer
                    ),
                })?;

            let mut spliced_layers = plan.base_layers.clone();
            spliced_layers.extend_from_slice(&layers[cut + 1..]);
            layers = spliced_layers;

            let kept_diff_ids = diff_ids.split_off(cut + 1);
            diff_ids = plan.base_diff_ids.clone();
            diff_ids.extend(kept_diff_ids);

            layer_digests = splice_layers(
                &self.name,
                &layer_digests,
                &plan.old_top_layer,
                &plan.base_layer_digests,
            )?;
        }

        for reused in &self.reused_layers {
            let idx = layer_digests
                .iter()
                .position(|d| d == reused)
                .ok_or_else(|| {
                    KilnError::registry(
                        self.reference.registry(),
                        format!("image '{}' has no layer '{reused}' to reuse", self.name),
                    )
                })?;
            layers.push(layers[idx].clone());
            diff_ids.push(diff_ids[idx].clone());
        }

        for (layer, diff_id) in &self.added_layers {
            layers.push(layer.clone());
            diff_ids.push(diff_id.clone());
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

        let config_obj = Config::new(
            serde_json::to_vec(&config)?,
            state.config_media_type,
            None,
        );
        let new_manifest = OciImageManifest::build(&layers, &config_obj, None);
        let digest = tarball::sha256_digest(&serde_json::to_vec(&new_manifest)?);

        let target = self
            .save_name
            .parse::<Reference>()
            .map_err(|e| KilnError::InvalidReference {
                reference: self.save_name.clone(),
                message: e.to_string(),
            })?;

        self.client
            .push(
                &target,
                &layers,
                config_obj,
                &self.auth.to_oci_auth(),
                Some(new_manifest),
            )
            .await
            .map_err(|e| KilnError::registry(target.registry(), e))?;

        tracing::debug!(reference = %target, digest = %digest, "pushed image");

        self.staged_labels.clear();
        self.added_layers.clear();
        self.reused_layers.clear();
        self.rebase_plan = None;
        self.state = OnceCell::new();
        self.saved_digest = Some(digest.clone());

        Ok(digest)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn diff_ids_of(config: &serde_json::Value) -> Result<Vec<String>> {
    let ids = config["rootfs"]["diff_ids"].as_array().ok_or_else(|| {
        KilnError::Config("image config has no rootfs.diff_ids".to_string())
    })?;
    Ok(ids
        .iter()
        .filter_map(|v| v.as_str().map(String::from))
        .collect())
}
