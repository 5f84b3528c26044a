//! Builder image creation.
//!
//! A builder is the stack's build image with the configured buildpacks and a
//! generated `order.toml` layered on top, stamped with the stack id. Each
//! buildpack directory becomes one gzipped tar layer.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use kiln_core::error::{KilnError, Result};
use kiln_core::{style, Config, Reporter};

use crate::image::{Image, ImageFactory};
use crate::metadata::STACK_ID_LABEL;
use crate::tarball;

/// Flags for `create-builder`.
#[derive(Debug, Clone, Default)]
pub struct CreateBuilderFlags {
    pub repo_name: String,
    pub builder_config_path: PathBuf,
    /// Stack id; empty means the default stack.
    pub stack: String,
    pub publish: bool,
    pub no_pull: bool,
}

/// Parsed builder configuration TOML.
#[derive(Debug, Deserialize)]
pub struct BuilderConfig {
    #[serde(default)]
    pub buildpacks: Vec<BuildpackRef>,
    #[serde(default)]
    pub groups: Vec<Group>,
}

/// One buildpack to bake into the builder.
#[derive(Debug, Deserialize)]
pub struct BuildpackRef {
    pub id: String,
    #[serde(default)]
    pub uri: String,
}

/// One detection group, in order of preference.
#[derive(Debug, Serialize, Deserialize)]
pub struct Group {
    pub buildpacks: Vec<GroupEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GroupEntry {
    pub id: String,
    pub version: String,
}

#[derive(Serialize)]
struct OrderToml<'a> {
    groups: &'a [Group],
}

/// Builds builder images from a stack and a builder configuration.
pub struct BuilderFactory<'a> {
    pub config: &'a Config,
    pub factory: &'a ImageFactory,
    pub reporter: &'a Reporter,
}

impl BuilderFactory<'_> {
    pub async fn create(&self, flags: &CreateBuilderFlags) -> Result<()> {
        let stack = self.config.get(&flags.stack)?;
        let raw = std::fs::read_to_string(&flags.builder_config_path)?;
        let builder_config: BuilderConfig = toml::from_str(&raw)?;
        let base_dir = flags
            .builder_config_path
            .parent()
            .unwrap_or(Path::new("."))
            .to_path_buf();

        let mut image = if flags.publish {
            self.factory.new_remote(&stack.build_image)?
        } else {
            self.factory
                .new_local(&stack.build_image, !flags.no_pull)
                .await?
        };
        image.rename(&flags.repo_name);

        let scratch = tempfile::tempdir()?;
        populate(
            image.as_mut(),
            &stack.id,
            &base_dir,
            &builder_config,
            scratch.path(),
        )
        .await?;

        image.save().await?;
        self.reporter.info(format!(
            "Successfully created builder image {}",
            style::identifier(&flags.repo_name)
        ));
        Ok(())
    }
}

/// Stage the buildpack layers, the order layer, and the stack label onto the
/// base image.
async fn populate(
    image: &mut dyn Image,
    stack_id: &str,
    base_dir: &Path,
    builder_config: &BuilderConfig,
    scratch: &Path,
) -> Result<()> {
    for (i, buildpack) in builder_config.buildpacks.iter().enumerate() {
        let dir = buildpack_dir(base_dir, buildpack)?;
        let layer = scratch.join(format!("buildpack-{i}.tar.gz"));
        tarball::targz_dir(&dir, &format!("buildpacks/{}", buildpack.id), &layer)?;
        image.add_layer(&layer).await?;
    }

    let order_dir = scratch.join("order");
    std::fs::create_dir_all(&order_dir)?;
    let order = toml::to_string(&OrderToml {
        groups: &builder_config.groups,
    })?;
    std::fs::write(order_dir.join("order.toml"), order)?;
    let order_layer = scratch.join("order.tar.gz");
    tarball::targz_dir(&order_dir, "buildpacks", &order_layer)?;
    image.add_layer(&order_layer).await?;

    image.set_label(STACK_ID_LABEL, stack_id)?;
    Ok(())
}

/// Resolve a buildpack's directory from its uri, relative to the builder
/// config file.
fn buildpack_dir(base_dir: &Path, buildpack: &BuildpackRef) -> Result<PathBuf> {
    let raw = buildpack.uri.strip_prefix("file://").unwrap_or(&buildpack.uri);
    if raw.is_empty() {
        return Err(KilnError::Config(format!(
            "buildpack '{}' has no uri",
            buildpack.id
        )));
    }
    let path = Path::new(raw);
    let dir = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    };
    if !dir.is_dir() {
        return Err(KilnError::Config(format!(
            "buildpack '{}' directory not found: {}",
            buildpack.id,
            dir.display()
        )));
    }
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kiln_core::error::Result;
    use std::any::Any;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingImage {
        labels: HashMap<String, String>,
        layers: Vec<PathBuf>,
    }

    #[async_trait]
    impl Image for RecordingImage {
        fn name(&self) -> &str {
            "recording"
        }
        fn rename(&mut self, _name: &str) {}
        async fn label(&self, _key: &str) -> Result<String> {
            Ok(String::new())
        }
        fn set_label(&mut self, key: &str, value: &str) -> Result<()> {
            self.labels.insert(key.to_string(), value.to_string());
            Ok(())
        }
        async fn add_layer(&mut self, tarball: &Path) -> Result<()> {
            self.layers.push(tarball.to_path_buf());
            Ok(())
        }
        async fn reuse_layer(&mut self, _layer_id: &str) -> Result<()> {
            Ok(())
        }
        async fn top_layer(&self) -> Result<String> {
            Ok(String::new())
        }
        async fn digest(&self) -> Result<String> {
            Ok(String::new())
        }
        async fn rebase(&mut self, _old_top: &str, _new_base: &dyn Image) -> Result<()> {
            Ok(())
        }
        async fn save(&mut self) -> Result<String> {
            Ok(String::new())
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    const BUILDER_TOML: &str = r#"
[[buildpacks]]
id = "org.example.node"
uri = "node"

[[groups]]
buildpacks = [{ id = "org.example.node", version = "0.0.1" }]
"#;

    #[test]
    fn test_parse_builder_config() {
        let parsed: BuilderConfig = toml::from_str(BUILDER_TOML).unwrap();
        assert_eq!(parsed.buildpacks.len(), 1);
        assert_eq!(parsed.buildpacks[0].id, "org.example.node");
        assert_eq!(parsed.groups[0].buildpacks[0].version, "0.0.1");
    }

    #[tokio::test]
    async fn test_populate_stages_layers_and_stack_label() {
        let tmp = TempDir::new().unwrap();
        let bp_dir = tmp.path().join("node");
        std::fs::create_dir_all(&bp_dir).unwrap();
        std::fs::write(bp_dir.join("buildpack.toml"), "[buildpack]\n").unwrap();

        let builder_config: BuilderConfig = toml::from_str(BUILDER_TOML).unwrap();
        let scratch = TempDir::new().unwrap();
        let mut image = RecordingImage::default();

        populate(
            &mut image,
            "org.example.stack",
            tmp.path(),
            &builder_config,
            scratch.path(),
        )
        .await
        .unwrap();

        // one layer per buildpack plus the order layer
        assert_eq!(image.layers.len(), 2);
        assert!(image.layers.iter().all(|p| p.exists()));
        assert_eq!(
            image.labels.get(STACK_ID_LABEL).map(String::as_str),
            Some("org.example.stack")
        );
    }

    #[test]
    fn test_buildpack_dir_rejects_missing() {
        let tmp = TempDir::new().unwrap();
        let err = buildpack_dir(
            tmp.path(),
            &BuildpackRef {
                id: "org.example.gone".to_string(),
                uri: "missing".to_string(),
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("org.example.gone"));
    }
}
