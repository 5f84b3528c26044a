use thiserror::Error;

/// Kiln error types.
///
/// User-facing messages name the offending entity (stack id, image reference)
/// wrapped in single quotes; the CLI boundary applies styling on top.
#[derive(Error, Debug)]
pub enum KilnError {
    /// Stack lookup miss
    #[error("stack '{0}' does not exist")]
    StackNotFound(String),

    /// Duplicate stack id on add
    #[error("stack '{0}' already exists")]
    StackAlreadyExists(String),

    /// Deleting the stack that is currently the default
    #[error("'{0}' cannot be deleted when it is the default stack. You can change your default stack by running \"kiln set-default-stack\".")]
    DefaultStackUndeletable(String),

    /// Stack unusable for rebase or build
    #[error("invalid stack: stack '{0}' requires at least one run image")]
    InvalidStack(String),

    /// Registry resolution given no candidates
    #[error("no run images to select from")]
    NoRunImages,

    /// Image does not exist in the backing store
    #[error("image '{0}' does not exist")]
    ImageNotFound(String),

    /// Required label absent from an image
    #[error("image '{image}' is missing label '{label}'")]
    MissingLabel { image: String, label: String },

    /// Embedded metadata failed to decode
    #[error("corrupt metadata on image '{image}': {message}")]
    CorruptMetadata { image: String, message: String },

    /// Malformed image reference
    #[error("invalid image reference '{reference}': {message}")]
    InvalidReference { reference: String, message: String },

    /// Container daemon transport error
    #[error("docker: {0}")]
    Docker(String),

    /// Registry transport error
    #[error("registry {registry}: {message}")]
    Registry { registry: String, message: String },

    /// Build pipeline phase failure
    #[error("build failed: {0}")]
    Build(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML encoding error
    #[error("configuration encoding error: {0}")]
    Toml(String),
}

impl KilnError {
    /// Wrap a daemon transport error.
    pub fn docker(err: impl std::fmt::Display) -> Self {
        KilnError::Docker(err.to_string())
    }

    /// Wrap a registry transport error.
    pub fn registry(registry: impl Into<String>, err: impl std::fmt::Display) -> Self {
        KilnError::Registry {
            registry: registry.into(),
            message: err.to_string(),
        }
    }
}

impl From<toml::de::Error> for KilnError {
    fn from(err: toml::de::Error) -> Self {
        KilnError::Toml(err.to_string())
    }
}

impl From<toml::ser::Error> for KilnError {
    fn from(err: toml::ser::Error) -> Self {
        KilnError::Toml(err.to_string())
    }
}

/// Result type alias for kiln operations.
pub type Result<T> = std::result::Result<T, KilnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_not_found_display() {
        let err = KilnError::StackNotFound("org.example.stack".to_string());
        assert_eq!(err.to_string(), "stack 'org.example.stack' does not exist");
    }

    #[test]
    fn test_default_stack_undeletable_names_remedy() {
        let err = KilnError::DefaultStackUndeletable("my.stack".to_string());
        assert!(err.to_string().contains("set-default-stack"));
    }

    #[test]
    fn test_missing_label_display() {
        let err = KilnError::MissingLabel {
            image: "myorg/app".to_string(),
            label: "io.buildpacks.stack.id".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "image 'myorg/app' is missing label 'io.buildpacks.stack.id'"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: KilnError = io_err.into();
        assert!(matches!(err, KilnError::Io(_)));
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{ nope").unwrap_err();
        let err: KilnError = json_err.into();
        assert!(matches!(err, KilnError::Serialization(_)));
    }
}
