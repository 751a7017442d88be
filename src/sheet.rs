//! Pushing records to a spreadsheet service that already holds earlier rows.

use async_trait::async_trait;
use csv::{ReaderBuilder, WriterBuilder};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::path::PathBuf;

use crate::error::{Result, ScrapeError};
use crate::tabular::{key_of, Record};

#[async_trait]
pub trait SheetSink: Send {
    /// Keys already present remotely in `key_column`.
    async fn existing_keys(&self, key_column: &str) -> Result<HashSet<String>>;

    /// Appends rows laid out as `columns`; returns how many were written.
    async fn append_rows(&mut self, columns: &[String], rows: Vec<Vec<String>>) -> Result<usize>;
}

/// A local CSV file standing in for the remote sheet.
#[derive(Debug, Clone)]
pub struct CsvSheet {
    path: PathBuf,
    delimiter: u8,
}

impl CsvSheet {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            delimiter: b',',
        }
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }
}

#[async_trait]
impl SheetSink for CsvSheet {
    async fn existing_keys(&self, key_column: &str) -> Result<HashSet<String>> {
        if !self.path.exists() {
            return Ok(HashSet::new());
        }
        let mut reader = ReaderBuilder::new()
            .delimiter(self.delimiter)
            .flexible(true)
            .from_path(&self.path)?;
        let Some(idx) = reader.headers()?.iter().position(|h| h == key_column) else {
            tracing::warn!(path = %self.path.display(), key_column, "Key column missing from sheet");
            return Ok(HashSet::new());
        };
        let mut keys = HashSet::new();
        for row in reader.records() {
            if let Some(k) = row?.get(idx).filter(|k| !k.is_empty()) {
                keys.insert(k.to_string());
            }
        }
        Ok(keys)
    }

    async fn append_rows(&mut self, columns: &[String], rows: Vec<Vec<String>>) -> Result<usize> {
        let fresh = std::fs::metadata(&self.path)
            .map(|m| m.len() == 0)
            .unwrap_or(true);
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)?;
        let mut writer = WriterBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(false)
            .from_writer(file);
        if fresh {
            writer.write_record(columns)?;
        }
        for row in &rows {
            writer.write_record(row)?;
        }
        writer.flush()?;
        tracing::info!(rows = rows.len(), path = %self.path.display(), "Appended rows to sheet");
        Ok(rows.len())
    }
}

fn cell_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Lays records out in `columns` order, stopping at the first record whose key is
/// already in the sheet.
pub fn rows_for_sheet(
    records: &[Record],
    columns: &[String],
    key_column: &str,
    existing: &HashSet<String>,
) -> Vec<Vec<String>> {
    records
        .iter()
        .take_while(|r| key_of(r, key_column).map_or(true, |k| !existing.contains(&k)))
        .map(|r| columns.iter().map(|c| cell_text(r.get(c))).collect())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SheetExport {
    pub appended: usize,
    pub stopped_early: bool,
}

pub async fn export_to_sheet<S: SheetSink + ?Sized>(
    sink: &mut S,
    records: &[Record],
    columns: &[String],
    key_column: &str,
) -> Result<SheetExport> {
    if !columns.iter().any(|c| c == key_column) {
        return Err(ScrapeError::Config(format!(
            "key column {key_column} is not among the exported columns"
        )));
    }
    let existing = sink.existing_keys(key_column).await?;
    let rows = rows_for_sheet(records, columns, key_column, &existing);
    let stopped_early = rows.len() < records.len();
    if stopped_early {
        tracing::info!(
            kept = rows.len(),
            offered = records.len(),
            "Reached a row already in the sheet"
        );
    }
    let appended = if rows.is_empty() {
        0
    } else {
        sink.append_rows(columns, rows).await?
    };
    Ok(SheetExport {
        appended,
        stopped_early,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn records() -> Vec<Record> {
        [
            json!({"id": "3", "nom": "Durand", "tel": null}),
            json!({"id": "2", "nom": "Martin", "tel": "0600"}),
            json!({"id": "1", "nom": "Petit", "tel": "0700"}),
        ]
        .into_iter()
        .map(|v| v.as_object().unwrap().clone())
        .collect()
    }

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn rows_follow_column_order_and_stop_at_known_key() {
        let existing: HashSet<String> = ["2".to_string()].into();
        let rows = rows_for_sheet(&records(), &cols(&["tel", "id"]), "id", &existing);
        assert_eq!(rows, vec![vec!["".to_string(), "3".to_string()]]);
    }

    #[tokio::test]
    async fn csv_sheet_appends_only_new_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut sheet = CsvSheet::new(dir.path().join("sheet.csv"));
        let columns = cols(&["id", "nom"]);

        let all = records();
        let first = export_to_sheet(&mut sheet, &all[2..], &columns, "id").await.unwrap();
        assert_eq!(first.appended, 1);
        assert!(!first.stopped_early);

        let second = export_to_sheet(&mut sheet, &all, &columns, "id").await.unwrap();
        assert_eq!(second.appended, 2);
        assert!(second.stopped_early);

        let text = std::fs::read_to_string(dir.path().join("sheet.csv")).unwrap();
        assert_eq!(text, "id,nom\n1,Petit\n3,Durand\n2,Martin\n");
        assert_eq!(sheet.existing_keys("id").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn unknown_key_column_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut sheet = CsvSheet::new(dir.path().join("s.csv"));
        let err = export_to_sheet(&mut sheet, &records(), &cols(&["nom"]), "id")
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::Config(_)));
    }

    #[tokio::test]
    async fn semicolon_sheet_round_trips_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fr.csv");
        let mut sheet = CsvSheet::new(&path).with_delimiter(b';');
        export_to_sheet(&mut sheet, &records(), &cols(&["id", "tel"]), "id")
            .await
            .unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().starts_with("id;tel\n3;\n"));
        let keys = sheet.existing_keys("id").await.unwrap();
        assert!(keys.contains("1") && keys.contains("3"));
    }
}
