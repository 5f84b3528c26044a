//! Rebase engine.
//!
//! Swaps the base ("run") layers beneath an already-built app image for a
//! newer run image's layers without touching the app layers, and rewrites
//! the embedded build metadata to point at the new base. All staging happens
//! in the image handle; nothing lands until `save`, so a failure anywhere
//! leaves the backing store unmodified.

use kiln_core::config::{run_image_by_registry, Config};
use kiln_core::error::{KilnError, Result};
use kiln_core::reference::ImageReference;
use kiln_core::{style, Reporter};

use crate::image::{Image, ImageFactory};
use crate::metadata::{AppImageMetadata, METADATA_LABEL, STACK_ID_LABEL};

/// Flags the rebase command hands to the engine.
#[derive(Debug, Clone, Default)]
pub struct RebaseFlags {
    pub repo_name: String,
    /// Work against the registry directly instead of the daemon.
    pub publish: bool,
    /// Skip pulling before daemon-resident use.
    pub no_pull: bool,
}

/// One rebase in flight: the app image and its replacement base.
pub struct RebaseOperation {
    pub image: Box<dyn Image>,
    pub new_base: Box<dyn Image>,
}

/// Resolves and executes rebase operations.
pub struct Rebaser<'a> {
    pub config: &'a Config,
    pub factory: &'a ImageFactory,
    pub reporter: &'a Reporter,
}

impl Rebaser<'_> {
    /// Resolve the app image and its new base from flags: read the stack id
    /// off the app image, look the stack up, and pick the run image matching
    /// the app image's own registry.
    pub async fn prepare(&self, flags: &RebaseFlags) -> Result<RebaseOperation> {
        let image = self.new_image(&flags.repo_name, flags).await?;

        let stack_id = image.label(STACK_ID_LABEL).await?;
        if stack_id.is_empty() {
            return Err(KilnError::MissingLabel {
                image: flags.repo_name.clone(),
                label: STACK_ID_LABEL.to_string(),
            });
        }

        let base_name = self.run_image_name(&stack_id, &flags.repo_name)?;
        tracing::debug!(stack = %stack_id, run_image = %base_name, "resolved rebase base");
        let new_base = self.new_image(&base_name, flags).await?;

        Ok(RebaseOperation { image, new_base })
    }

    /// Rebase the app image onto the new base and update its metadata label
    /// so the recorded base digest and top layer stay consistent as a pair.
    pub async fn rebase(&self, mut op: RebaseOperation) -> Result<()> {
        let raw = op.image.label(METADATA_LABEL).await?;
        let mut metadata = AppImageMetadata::from_label(op.image.name(), &raw)?;

        op.image
            .rebase(&metadata.run_image.top_layer, op.new_base.as_ref())
            .await?;

        metadata.run_image.sha = op.new_base.digest().await?;
        metadata.run_image.top_layer = op.new_base.top_layer().await?;
        op.image.set_label(METADATA_LABEL, &metadata.to_label()?)?;

        op.image.save().await?;
        self.reporter.info(format!(
            "Successfully rebased image {}",
            style::identifier(op.image.name())
        ));
        Ok(())
    }

    async fn new_image(&self, name: &str, flags: &RebaseFlags) -> Result<Box<dyn Image>> {
        if flags.publish {
            self.factory.new_remote(name)
        } else {
            self.factory.new_local(name, !flags.no_pull).await
        }
    }

    fn run_image_name(&self, stack_id: &str, repo_name: &str) -> Result<String> {
        let stack = self.config.get(stack_id)?;
        if stack.run_images.is_empty() {
            return Err(KilnError::InvalidStack(stack.id.clone()));
        }
        let registry = ImageReference::registry_of(repo_name)?;
        run_image_by_registry(&registry, &stack.run_images)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::DockerClient;
    use crate::image::splice_layers;
    use async_trait::async_trait;
    use std::any::Any;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeState {
        labels: HashMap<String, String>,
        layers: Vec<String>,
        saves: usize,
    }

    /// In-memory stand-in implementing the image contract. State is shared
    /// so tests can assert on it after the engine consumes the handle.
    struct FakeImage {
        name: String,
        digest: String,
        state: Arc<Mutex<FakeState>>,
    }

    impl FakeImage {
        fn new(name: &str, layers: &[&str], digest: &str) -> (Self, Arc<Mutex<FakeState>>) {
            let state = Arc::new(Mutex::new(FakeState {
                layers: layers.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            }));
            (
                Self {
                    name: name.to_string(),
                    digest: digest.to_string(),
                    state: state.clone(),
                },
                state,
            )
        }
    }

    #[async_trait]
    impl Image for FakeImage {
        fn name(&self) -> &str {
            &self.name
        }

        fn rename(&mut self, name: &str) {
            self.name = name.to_string();
        }

        async fn label(&self, key: &str) -> Result<String> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .labels
                .get(key)
                .cloned()
                .unwrap_or_default())
        }

        fn set_label(&mut self, key: &str, value: &str) -> Result<()> {
            self.state
                .lock()
                .unwrap()
                .labels
                .insert(key.to_string(), value.to_string());
            Ok(())
        }

        async fn add_layer(&mut self, _tarball: &Path) -> Result<()> {
            unimplemented!("not exercised by rebase")
        }

        async fn reuse_layer(&mut self, layer_id: &str) -> Result<()> {
            self.state.lock().unwrap().layers.push(layer_id.to_string());
            Ok(())
        }

        async fn top_layer(&self) -> Result<String> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .layers
                .last()
                .cloned()
                .unwrap_or_default())
        }

        async fn digest(&self) -> Result<String> {
            Ok(self.digest.clone())
        }

        async fn rebase(&mut self, old_top_layer: &str, new_base: &dyn Image) -> Result<()> {
            let base = new_base.as_any().downcast_ref::<FakeImage>().unwrap();
            let base_layers = base.state.lock().unwrap().layers.clone();
            let mut state = self.state.lock().unwrap();
            state.layers = splice_layers(&self.name, &state.layers, old_top_layer, &base_layers)?;
            Ok(())
        }

        async fn save(&mut self) -> Result<String> {
            self.state.lock().unwrap().saves += 1;
            Ok(self.digest.clone())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn fixtures() -> (TempDir, Config, ImageFactory, Reporter) {
        let tmp = TempDir::new().unwrap();
        let config = Config::new(tmp.path()).unwrap();
        let factory = ImageFactory::new(DockerClient::connect().unwrap());
        let reporter = Reporter::new(false, true);
        (tmp, config, factory, reporter)
    }

    const APP_METADATA: &str = r#"{"runImage":{"sha":"sha256:d1","topLayer":"sha256:l1"},"app":{"sha":"sha256:keepme"}}"#;

    #[tokio::test]
    async fn test_rebase_round_trip() {
        let (_tmp, config, factory, reporter) = fixtures();
        let rebaser = Rebaser {
            config: &config,
            factory: &factory,
            reporter: &reporter,
        };

        let (app, app_state) = FakeImage::new(
            "myorg/app",
            &["sha256:b1", "sha256:l1", "sha256:app1", "sha256:app2"],
            "sha256:appdigest",
        );
        app_state
            .lock()
            .unwrap()
            .labels
            .insert(METADATA_LABEL.to_string(), APP_METADATA.to_string());
        let (new_base, _) = FakeImage::new("packs/run", &["sha256:n1", "sha256:l2"], "sha256:d2");

        rebaser
            .rebase(RebaseOperation {
                image: Box::new(app),
                new_base: Box::new(new_base),
            })
            .await
            .unwrap();

        let state = app_state.lock().unwrap();
        // app layers above the old base top survive, in order, on the new base
        assert_eq!(
            state.layers,
            vec!["sha256:n1", "sha256:l2", "sha256:app1", "sha256:app2"]
        );
        assert_eq!(state.saves, 1);

        // metadata records the new base digest and top layer as a pair,
        // and unrelated fields survive the round trip
        let saved: serde_json::Value =
            serde_json::from_str(state.labels.get(METADATA_LABEL).unwrap()).unwrap();
        assert_eq!(saved["runImage"]["sha"], "sha256:d2");
        assert_eq!(saved["runImage"]["topLayer"], "sha256:l2");
        assert_eq!(saved["app"]["sha"], "sha256:keepme");
    }

    #[tokio::test]
    async fn test_rebase_corrupt_metadata_leaves_image_unsaved() {
        let (_tmp, config, factory, reporter) = fixtures();
        let rebaser = Rebaser {
            config: &config,
            factory: &factory,
            reporter: &reporter,
        };

        let (app, app_state) = FakeImage::new("myorg/app", &["sha256:b1"], "sha256:d");
        app_state
            .lock()
            .unwrap()
            .labels
            .insert(METADATA_LABEL.to_string(), "{ not json".to_string());
        let (new_base, _) = FakeImage::new("packs/run", &["sha256:n1"], "sha256:d2");

        let err = rebaser
            .rebase(RebaseOperation {
                image: Box::new(app),
                new_base: Box::new(new_base),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::CorruptMetadata { .. }));
        assert_eq!(app_state.lock().unwrap().saves, 0);
    }

    #[tokio::test]
    async fn test_rebase_unknown_top_layer_leaves_image_unsaved() {
        let (_tmp, config, factory, reporter) = fixtures();
        let rebaser = Rebaser {
            config: &config,
            factory: &factory,
            reporter: &reporter,
        };

        let (app, app_state) = FakeImage::new("myorg/app", &["sha256:other"], "sha256:d");
        app_state
            .lock()
            .unwrap()
            .labels
            .insert(METADATA_LABEL.to_string(), APP_METADATA.to_string());
        let (new_base, _) = FakeImage::new("packs/run", &["sha256:n1"], "sha256:d2");

        let err = rebaser
            .rebase(RebaseOperation {
                image: Box::new(app),
                new_base: Box::new(new_base),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::CorruptMetadata { .. }));
        assert_eq!(app_state.lock().unwrap().saves, 0);
    }

    #[test]
    fn test_run_image_name_rejects_stack_without_run_images() {
        let (_tmp, mut config, factory, reporter) = fixtures();
        config
            .add(kiln_core::Stack {
                id: "org.example.empty".to_string(),
                build_image: "org.example/build".to_string(),
                build_images: None,
                run_images: vec![],
            })
            .unwrap();
        let rebaser = Rebaser {
            config: &config,
            factory: &factory,
            reporter: &reporter,
        };

        let err = rebaser
            .run_image_name("org.example.empty", "myorg/app")
            .unwrap_err();
        assert!(matches!(err, KilnError::InvalidStack(_)));
    }

    #[test]
    fn test_run_image_name_picks_registry_match() {
        let (_tmp, mut config, factory, reporter) = fixtures();
        config
            .add(kiln_core::Stack {
                id: "org.example.multi".to_string(),
                build_image: "org.example/build".to_string(),
                build_images: None,
                run_images: vec!["quay.io/r/run".to_string(), "docker.io/r/run".to_string()],
            })
            .unwrap();
        let rebaser = Rebaser {
            config: &config,
            factory: &factory,
            reporter: &reporter,
        };

        // the app image is headed for docker.io, so the docker.io run image wins
        let name = rebaser
            .run_image_name("org.example.multi", "myorg/app")
            .unwrap();
        assert_eq!(name, "docker.io/r/run");
    }
}
