// 📊 Spreadsheet Export
// Joined attribute table → tab-delimited sheet with a header row

use crate::backend::AttributeTable;
use crate::error::{PipelineError, Result};
use crate::workspace::RunWorkspace;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub struct SpreadsheetArtifact {
    pub path: PathBuf,
    pub rows: usize,
    pub columns: usize,
}

/// Write every column and row of `table` to the run's spreadsheet path.
/// Taking the workspace guarantees the `excel/` folder exists.
pub fn export_spreadsheet(workspace: &RunWorkspace, table: &AttributeTable) -> Result<SpreadsheetArtifact> {
    let path = workspace.spreadsheet_path();

    let file = match OpenOptions::new().write(true).create_new(true).open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            return Err(PipelineError::ArtifactCollision(path));
        }
        Err(e) => return Err(e.into()),
    };

    let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_writer(file);
    writer.write_record(&table.columns)?;
    for row in &table.rows {
        writer.write_record(row.iter().map(|v| v.to_string()))?;
    }
    writer.flush()?;

    info!(path = %path.display(), rows = table.rows.len(), "spreadsheet written");

    Ok(SpreadsheetArtifact {
        path,
        rows: table.rows.len(),
        columns: table.columns.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::FieldValue;
    use crate::workspace::RunDate;
    use std::fs;

    fn workspace(tmp: &tempfile::TempDir) -> RunWorkspace {
        RunWorkspace::create(tmp.path(), RunDate::from_ymd(2024, 3, 5).unwrap()).unwrap()
    }

    #[test]
    fn test_writes_header_and_rows() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = workspace(&tmp);
        let table = AttributeTable {
            columns: vec!["PIN".into(), "Type".into(), "IN_SDE".into()],
            rows: vec![
                vec!["A1".into(), "GARAGE".into(), FieldValue::Null],
                vec!["A2".into(), "SHED".into(), FieldValue::Null],
            ],
        };

        let artifact = export_spreadsheet(&ws, &table).unwrap();

        assert_eq!(artifact.rows, 2);
        assert!(artifact.path.ends_with("excel/2024_03_05.xls"));
        let content = fs::read_to_string(&artifact.path).unwrap();
        assert_eq!(content, "PIN\tType\tIN_SDE\nA1\tGARAGE\t\nA2\tSHED\t\n");
    }

    #[test]
    fn test_empty_table_has_header_only() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = workspace(&tmp);
        let table = AttributeTable { columns: vec!["PIN".into()], rows: vec![] };

        let artifact = export_spreadsheet(&ws, &table).unwrap();

        assert_eq!(artifact.rows, 0);
        assert_eq!(fs::read_to_string(&artifact.path).unwrap(), "PIN\n");
    }

    #[test]
    fn test_refuses_to_overwrite() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = workspace(&tmp);
        let table = AttributeTable { columns: vec!["PIN".into()], rows: vec![] };
        export_spreadsheet(&ws, &table).unwrap();

        let err = export_spreadsheet(&ws, &table).unwrap_err();
        assert!(matches!(err, PipelineError::ArtifactCollision(_)));
    }
}
