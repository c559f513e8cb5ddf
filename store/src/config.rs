use serde::Deserialize;
use std::path::PathBuf;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("sqlite table path cannot be empty")]
    EmptyPath,
}

/// Where the single table lives. The memory table is lost on restart and
/// only guards ingestion within one process.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum TableType {
    #[default]
    Memory,
    Sqlite {
        path: PathBuf,
    },
}

impl TableType {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let TableType::Sqlite { path } = self
            && path.as_os_str().is_empty()
        {
            return Err(ValidationError::EmptyPath);
        }
        Ok(())
    }
}
