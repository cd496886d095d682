use sediment_storage::StorageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Index not found: {0}")]
    IndexNotFound(String),

    #[error("Index already exists: {0}")]
    IndexAlreadyExists(String),

    #[error("Index [{index}] {op} error: {source}")]
    Open {
        index: String,
        op: &'static str,
        #[source]
        source: Box<Error>,
    },

    #[error("Analysis error: {0}")]
    Analysis(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wrap an error raised while opening a handle for `index`.
    pub fn open(index: &str, op: &'static str, source: impl Into<Error>) -> Self {
        Error::Open {
            index: index.to_string(),
            op,
            source: Box::new(source.into()),
        }
    }

    /// True for missing indexes, documents and segments, including wrapped ones.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::IndexNotFound(_) => true,
            Error::Storage(e) => e.is_not_found(),
            Error::Open { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_wraps_with_index_name() {
        let err = Error::open(
            "logs",
            "open writer",
            StorageError::Locked("/data/logs: held".to_string()),
        );
        assert_eq!(
            err.to_string(),
            "Index [logs] open writer error: Storage error: Lock unavailable: /data/logs: held"
        );
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_is_not_found_sees_through_wrapping() {
        let err = Error::open("logs", "open reader", StorageError::NotFound(".snp".into()));
        assert!(err.is_not_found());
        assert!(Error::IndexNotFound("x".into()).is_not_found());
        assert!(!Error::Config("bad".into()).is_not_found());
    }
}
