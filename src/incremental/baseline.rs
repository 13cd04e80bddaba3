//! Baseline of last-known filing dates

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::BaselineError;
use crate::records::{RecordError, StageReader};
use crate::types::EntityId;

/// Entity id to the filing date recorded in a prior run's output
#[derive(Debug, Clone, Default)]
pub struct Baseline {
    path: PathBuf,
    dates: HashMap<EntityId, String>,
}

impl Baseline {
    /// Read a baseline file once; the last row per id wins
    pub fn load(path: &Path, id_column: &str, date_column: &str) -> Result<Self, BaselineError> {
        if !path.exists() {
            return Err(BaselineError::NotFound(path.to_path_buf()));
        }

        let mut reader = StageReader::open_with_id(path, id_column).map_err(|e| match e {
            RecordError::MissingColumn { column, .. } => BaselineError::MissingColumn {
                path: path.to_path_buf(),
                column,
            },
            other => BaselineError::Record(other),
        })?;

        let date_idx = reader
            .column_index(date_column)
            .ok_or_else(|| BaselineError::MissingColumn {
                path: path.to_path_buf(),
                column: date_column.to_string(),
            })?;

        let mut dates = HashMap::new();
        for row in reader.rows() {
            match row {
                Ok(row) => {
                    let date = row.fields.get(date_idx).unwrap_or_default().trim().to_string();
                    dates.insert(row.record.id, date);
                }
                Err(e) => tracing::warn!("Skipping baseline row in {}: {}", path.display(), e),
            }
        }

        tracing::info!("Loaded baseline of {} entities from {}", dates.len(), path.display());
        Ok(Self {
            path: path.to_path_buf(),
            dates,
        })
    }

    pub fn from_dates<I, K, V>(dates: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<EntityId>,
        V: Into<String>,
    {
        Self {
            path: PathBuf::new(),
            dates: dates.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Recorded date for an entity; `Some("")` when the row had no date
    pub fn date_of(&self, id: &str) -> Option<&str> {
        self.dates.get(id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_custom_columns() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("baseline.csv");
        std::fs::write(&path, "Crd,Name,LastFiled\n1,A,01/10/2024\n2,B,\n1,A,01/12/2024\n").unwrap();

        let baseline = Baseline::load(&path, "Crd", "LastFiled").unwrap();
        assert_eq!(baseline.len(), 2);
        assert_eq!(baseline.date_of("1"), Some("01/12/2024"));
        assert_eq!(baseline.date_of("2"), Some(""));
        assert_eq!(baseline.date_of("3"), None);
    }

    #[test]
    fn test_missing_columns() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("baseline.csv");
        std::fs::write(&path, "EntityId,Name\n1,A\n").unwrap();

        assert!(matches!(
            Baseline::load(&path, "EntityId", "FilingDate"),
            Err(BaselineError::MissingColumn { column, .. }) if column == "FilingDate"
        ));
        assert!(matches!(
            Baseline::load(&path, "Crd", "FilingDate"),
            Err(BaselineError::MissingColumn { column, .. }) if column == "Crd"
        ));
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            Baseline::load(&dir.path().join("nope.csv"), "EntityId", "FilingDate"),
            Err(BaselineError::NotFound(_))
        ));
    }
}
