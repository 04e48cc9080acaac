use thiserror::Error;

/// Failures loading the client configuration or the persisted settings
#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid client configuration: {0}")]
    Validation(String),
}
