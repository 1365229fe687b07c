use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("Failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid geometry in {path:?}: {message}")]
    Format { path: PathBuf, message: String },

    #[error("Cannot decode {path:?} as '{encoding}': {message}")]
    Encoding {
        path: PathBuf,
        encoding: String,
        message: String,
    },

    #[error("Malformed table {path:?}: {source}")]
    Table {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("Column '{column}' not found (available: {})", .available.join(", "))]
    ColumnNotFound {
        column: String,
        available: Vec<String>,
    },

    #[error("Column '{0}' would appear twice in the result")]
    ColumnConflict(String),

    #[error("Style error: {0}")]
    Style(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn format(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        PipelineError::Format {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn column_not_found(column: &str, available: &[String]) -> Self {
        PipelineError::ColumnNotFound {
            column: column.to_string(),
            available: available.to_vec(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
