//! Configuration errors for idlegpu-core

pub type Result<T> = std::result::Result<T, Error>;

/// Raised while loading or validating [`Config`](crate::Config)
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A value was parsed but is out of range
    #[error("Configuration error: {0}")]
    InvalidConfiguration(String),

    /// A source could not be read or deserialized
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }
}
