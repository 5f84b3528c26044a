//! Persisted stack configuration store.
//!
//! Stacks pair one build image with one or more run images and live in
//! `config.toml` under `$KILN_HOME` (default `~/.kiln`). Every mutation is
//! flushed back to disk before the operation reports success; writes go
//! through a temp file and rename so a concurrent reader never observes a
//! partial file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{KilnError, Result};
use crate::reference::ImageReference;

/// Stack id of the built-in default stack.
pub const DEFAULT_STACK_ID: &str = "io.buildpacks.stacks.bionic";

/// Builder used when none has been configured.
pub const DEFAULT_BUILDER: &str = "packs/samples";

/// A named pairing of one build image with one or more run images.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stack {
    pub id: String,

    #[serde(rename = "build-image", default)]
    pub build_image: String,

    /// Legacy schema: multiple build images per stack. Migrated to
    /// `build_image` on load and never written back.
    #[serde(rename = "build-images", default, skip_serializing)]
    pub build_images: Option<Vec<String>>,

    #[serde(rename = "run-images", default)]
    pub run_images: Vec<String>,
}

/// The persisted set of stacks plus default selections.
#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "default-stack-id", default)]
    pub default_stack_id: String,

    #[serde(rename = "default-builder", default)]
    pub default_builder: String,

    #[serde(default)]
    pub stacks: Vec<Stack>,

    #[serde(skip)]
    config_path: PathBuf,
}

impl Config {
    /// Open the store at its default location: `$KILN_HOME`, else `~/.kiln`.
    pub fn new_default() -> Result<Self> {
        let home = match std::env::var_os("KILN_HOME") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::home_dir()
                .map(|h| h.join(".kiln"))
                .unwrap_or_else(|| PathBuf::from(".kiln")),
        };
        Self::new(&home)
    }

    /// Open (or create) the store in `dir`, applying defaults, the legacy
    /// build-images migration, and the built-in stack, then flushing the
    /// normalized state back to disk.
    pub fn new(dir: &Path) -> Result<Self> {
        let config_path = dir.join("config.toml");
        let mut config = Self::load(&config_path)?;

        if config.default_stack_id.is_empty() {
            config.default_stack_id = DEFAULT_STACK_ID.to_string();
        }
        if config.default_builder.is_empty() {
            config.default_builder = DEFAULT_BUILDER.to_string();
        }
        if !config.stacks.iter().any(|s| s.id == DEFAULT_STACK_ID) {
            config.stacks.push(Stack {
                id: DEFAULT_STACK_ID.to_string(),
                build_image: "packs/build".to_string(),
                build_images: None,
                run_images: vec!["packs/run".to_string()],
            });
        }

        config.config_path = config_path;
        config.save()?;
        Ok(config)
    }

    fn load(config_path: &Path) -> Result<Self> {
        let mut config: Config = match std::fs::read_to_string(config_path) {
            Ok(raw) => toml::from_str(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config {
                default_stack_id: String::new(),
                default_builder: String::new(),
                stacks: Vec::new(),
                config_path: PathBuf::new(),
            },
            Err(e) => return Err(e.into()),
        };
        config.migrate_build_images();
        Ok(config)
    }

    /// Fold the deprecated `build-images` list into the singular field.
    /// Idempotent; the legacy list never round-trips back to disk.
    fn migrate_build_images(&mut self) {
        for stack in &mut self.stacks {
            if stack.build_image.is_empty() {
                if let Some(images) = stack.build_images.as_ref().filter(|v| !v.is_empty()) {
                    stack.build_image = images[0].clone();
                    tracing::debug!(stack = %stack.id, build_image = %stack.build_image, "migrated legacy build-images entry");
                }
            }
            stack.build_images = None;
        }
    }

    /// Flush the full configuration to disk (temp file + rename).
    fn save(&self) -> Result<()> {
        let dir = self
            .config_path
            .parent()
            .ok_or_else(|| KilnError::Config("configuration path has no parent".to_string()))?;
        std::fs::create_dir_all(dir)?;

        let raw = toml::to_string(self)?;
        let tmp_path = self.config_path.with_extension("toml.tmp");
        std::fs::write(&tmp_path, raw)?;
        std::fs::rename(&tmp_path, &self.config_path)?;
        Ok(())
    }

    /// Look up a stack by id; an empty id resolves the default stack.
    pub fn get(&self, stack_id: &str) -> Result<&Stack> {
        let stack_id = if stack_id.is_empty() {
            &self.default_stack_id
        } else {
            stack_id
        };
        self.stacks
            .iter()
            .find(|s| s.id == *stack_id)
            .ok_or_else(|| KilnError::StackNotFound(stack_id.to_string()))
    }

    /// Add a new stack and persist.
    pub fn add(&mut self, stack: Stack) -> Result<()> {
        if self.get(&stack.id).is_ok() {
            return Err(KilnError::StackAlreadyExists(stack.id));
        }
        self.stacks.push(stack);
        self.save()
    }

    /// Update an existing stack and persist. The build image is replaced
    /// unconditionally; run images are replaced only when the supplied list
    /// is non-empty (an empty list means keep the existing ones).
    pub fn update(&mut self, stack_id: &str, new_stack: Stack) -> Result<()> {
        match self.stacks.iter_mut().find(|s| s.id == stack_id) {
            Some(stack) => {
                stack.build_image = new_stack.build_image;
                if !new_stack.run_images.is_empty() {
                    stack.run_images = new_stack.run_images;
                }
                self.save()
            }
            None => Err(KilnError::StackNotFound(stack_id.to_string())),
        }
    }

    /// Delete a stack and persist. The current default stack cannot be
    /// deleted; the default must be changed first.
    pub fn delete(&mut self, stack_id: &str) -> Result<()> {
        if self.default_stack_id == stack_id {
            return Err(KilnError::DefaultStackUndeletable(stack_id.to_string()));
        }
        match self.stacks.iter().position(|s| s.id == stack_id) {
            Some(i) => {
                self.stacks.remove(i);
                self.save()
            }
            None => Err(KilnError::StackNotFound(stack_id.to_string())),
        }
    }

    /// Make an existing stack the default and persist.
    pub fn set_default_stack(&mut self, stack_id: &str) -> Result<()> {
        if !self.stacks.iter().any(|s| s.id == stack_id) {
            return Err(KilnError::StackNotFound(stack_id.to_string()));
        }
        self.default_stack_id = stack_id.to_string();
        self.save()
    }

    /// Record the default builder and persist. The builder reference is
    /// opaque; it is not validated against any registry.
    pub fn set_default_builder(&mut self, builder: &str) -> Result<()> {
        self.default_builder = builder.to_string();
        self.save()
    }

    /// Directory holding the configuration file.
    pub fn path(&self) -> &Path {
        self.config_path.parent().unwrap_or(Path::new("."))
    }
}

/// Pick the run image whose registry host matches `registry`; when none
/// match, fall back to the first candidate.
pub fn run_image_by_registry(registry: &str, images: &[String]) -> Result<String> {
    if images.is_empty() {
        return Err(KilnError::NoRunImages);
    }
    for image in images {
        match ImageReference::registry_of(image) {
            Ok(reg) if reg == registry => return Ok(image.clone()),
            _ => continue,
        }
    }
    Ok(images[0].clone())
}
