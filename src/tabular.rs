//! Turns CSV and spreadsheet exports into JSON records.

use calamine::{Data, DataType, Ods, Reader, Xls, Xlsx};
use encoding_rs::WINDOWS_1252;
use serde::Serialize;
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::io::Cursor;

use crate::error::{Result, ScrapeError};

/// One exported row: column name to string or null, in column order.
pub type Record = Map<String, Value>;

/// Markers read as missing values, on top of the empty string.
const NA_MARKERS: &[&str] = &[
    "#N/A", "#N/A N/A", "#NA", "-1.#IND", "-1.#QNAN", "-NaN", "-nan", "1.#IND", "1.#QNAN",
    "<NA>", "N/A", "NA", "NULL", "NaN", "None", "n/a", "nan", "null",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    Latin1,
    Iso8859_1,
    Cp1252,
}

impl TextEncoding {
    pub const FALLBACK_ORDER: [TextEncoding; 4] = [
        TextEncoding::Utf8,
        TextEncoding::Latin1,
        TextEncoding::Iso8859_1,
        TextEncoding::Cp1252,
    ];

    pub fn label(self) -> &'static str {
        match self {
            TextEncoding::Utf8 => "utf-8",
            TextEncoding::Latin1 => "latin-1",
            TextEncoding::Iso8859_1 => "iso-8859-1",
            TextEncoding::Cp1252 => "cp1252",
        }
    }

    /// Strict for UTF-8; the single-byte encodings map every byte.
    pub fn decode(self, bytes: &[u8]) -> Option<Cow<'_, str>> {
        match self {
            TextEncoding::Utf8 => {
                let text = std::str::from_utf8(bytes).ok()?;
                Some(Cow::Borrowed(text.strip_prefix('\u{feff}').unwrap_or(text)))
            }
            TextEncoding::Latin1 | TextEncoding::Iso8859_1 => {
                Some(encoding_rs::mem::decode_latin1(bytes))
            }
            TextEncoding::Cp1252 => Some(WINDOWS_1252.decode_without_bom_handling(bytes).0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpreadsheetFormat {
    Xlsx,
    Xls,
    Ods,
}

impl SpreadsheetFormat {
    pub const FALLBACK_ORDER: [SpreadsheetFormat; 3] =
        [SpreadsheetFormat::Xlsx, SpreadsheetFormat::Xls, SpreadsheetFormat::Ods];

    fn read(self, bytes: &[u8]) -> std::result::Result<Table, String> {
        match self {
            SpreadsheetFormat::Xlsx => read_first_sheet::<Xlsx<_>>(bytes),
            SpreadsheetFormat::Xls => read_first_sheet::<Xls<_>>(bytes),
            SpreadsheetFormat::Ods => read_first_sheet::<Ods<_>>(bytes),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    Csv { delimiter: u8 },
    Spreadsheet,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub records: Vec<Record>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page {
    pub records: Vec<Record>,
    pub page: usize,
    pub page_size: usize,
    pub total_records: usize,
    pub total_pages: usize,
}

impl Table {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// 1-based page slice. Pages past the end are empty.
    pub fn page(&self, page: usize, page_size: usize) -> Result<Page> {
        if page == 0 || page_size == 0 {
            return Err(ScrapeError::InvalidPage { page, page_size });
        }
        let total_records = self.records.len();
        let start = (page - 1).saturating_mul(page_size).min(total_records);
        let end = start.saturating_add(page_size).min(total_records);
        Ok(Page {
            records: self.records[start..end].to_vec(),
            page,
            page_size,
            total_records,
            total_pages: total_records.div_ceil(page_size),
        })
    }
}

/// Coerces one raw cell: empty and NaN-like markers become null, anything else a
/// string without replacement characters or NULs.
pub fn cell_value(raw: &str) -> Value {
    if raw.trim().is_empty() || NA_MARKERS.contains(&raw) {
        return Value::Null;
    }
    let cleaned: String = raw
        .chars()
        .filter(|c| *c != '\u{fffd}' && *c != '\0')
        .collect();
    if cleaned.is_empty() {
        Value::Null
    } else {
        Value::String(cleaned)
    }
}

/// Names blank headers `Unnamed: i` and suffixes repeats with `.1`, `.2`, ...
fn unique_columns<I, S>(raw: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut taken: HashSet<String> = HashSet::new();
    raw.into_iter()
        .enumerate()
        .map(|(i, name)| {
            let name = name.as_ref().trim();
            let base = if name.is_empty() {
                format!("Unnamed: {i}")
            } else {
                name.to_string()
            };
            let mut candidate = base.clone();
            while taken.contains(&candidate) {
                let n = seen.entry(base.clone()).or_insert(0);
                *n += 1;
                candidate = format!("{base}.{n}");
            }
            taken.insert(candidate.clone());
            candidate
        })
        .collect()
}

fn parse_csv_text(text: &str, delimiter: u8) -> Table {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut rows = reader.records();
    let columns = loop {
        match rows.next() {
            None => return Table::default(),
            Some(Ok(header)) if header.iter().any(|h| !h.trim().is_empty()) => {
                break unique_columns(header.iter());
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Skipping unreadable header line");
            }
        }
    };

    let mut records = Vec::new();
    let mut skipped = 0usize;
    for row in rows {
        let row = match row {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping unreadable CSV line");
                skipped += 1;
                continue;
            }
        };
        if row.len() > columns.len() {
            skipped += 1;
            continue;
        }
        let mut record = Record::new();
        for (i, col) in columns.iter().enumerate() {
            record.insert(col.clone(), row.get(i).map(cell_value).unwrap_or(Value::Null));
        }
        records.push(record);
    }
    if skipped > 0 {
        tracing::warn!(skipped, "Skipped malformed CSV lines");
    }

    Table { columns, records }
}

/// Tries each encoding in order and keeps the first that yields at least one record.
pub fn normalize_csv(bytes: &[u8], delimiter: u8) -> Result<Table> {
    for encoding in TextEncoding::FALLBACK_ORDER {
        let Some(text) = encoding.decode(bytes) else {
            tracing::debug!(encoding = encoding.label(), "Export is not valid in this encoding");
            continue;
        };
        let table = parse_csv_text(&text, delimiter);
        if !table.is_empty() {
            tracing::info!(
                encoding = encoding.label(),
                rows = table.len(),
                columns = table.columns.len(),
                "Parsed CSV export"
            );
            return Ok(table);
        }
        tracing::debug!(encoding = encoding.label(), "Encoding produced an empty table");
    }
    tracing::error!(bytes = bytes.len(), "Failed to decode CSV data with any known encoding");
    Err(ScrapeError::Decode(
        "no encoding produced a non-empty CSV table".into(),
    ))
}

fn sheet_cell(cell: &Data) -> Value {
    match cell {
        Data::Empty | Data::Error(_) => Value::Null,
        Data::Float(f) if f.is_nan() => Value::Null,
        Data::DateTime(_) => cell
            .as_datetime()
            .map(|dt| Value::String(dt.format("%Y-%m-%d %H:%M:%S").to_string()))
            .unwrap_or(Value::Null),
        other => cell_value(&other.to_string()),
    }
}

fn read_first_sheet<R>(bytes: &[u8]) -> std::result::Result<Table, String>
where
    R: Reader<Cursor<Vec<u8>>>,
{
    let mut workbook = R::new(Cursor::new(bytes.to_vec())).map_err(|e| format!("{e:?}"))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| "workbook has no sheets".to_string())?
        .map_err(|e| format!("{e:?}"))?;

    let mut rows = range.rows();
    let Some(header) = rows.next() else {
        return Ok(Table::default());
    };
    let columns = unique_columns(header.iter().map(|c| c.to_string()));
    let records = rows
        .filter(|row| row.iter().any(|c| !matches!(c, Data::Empty)))
        .map(|row| {
            columns
                .iter()
                .enumerate()
                .map(|(i, col)| (col.clone(), row.get(i).map(sheet_cell).unwrap_or(Value::Null)))
                .collect::<Record>()
        })
        .collect();
    Ok(Table { columns, records })
}

/// Reads the first worksheet, trying each container format in order.
pub fn normalize_spreadsheet(bytes: &[u8]) -> Result<Table> {
    for format in SpreadsheetFormat::FALLBACK_ORDER {
        match format.read(bytes) {
            Ok(table) if !table.is_empty() => {
                tracing::info!(format = ?format, rows = table.len(), "Parsed spreadsheet export");
                return Ok(table);
            }
            Ok(_) => tracing::debug!(format = ?format, "Spreadsheet has no data rows"),
            Err(e) => tracing::debug!(format = ?format, error = %e, "Not readable in this format"),
        }
    }
    tracing::error!(bytes = bytes.len(), "Failed to read spreadsheet in any known format");
    Err(ScrapeError::Decode(
        "no spreadsheet format produced a non-empty table".into(),
    ))
}

pub fn normalize(bytes: &[u8], kind: ExportKind) -> Result<Table> {
    match kind {
        ExportKind::Csv { delimiter } => normalize_csv(bytes, delimiter),
        ExportKind::Spreadsheet => normalize_spreadsheet(bytes),
    }
}

pub fn key_of(record: &Record, key: &str) -> Option<String> {
    match record.get(key)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Keeps the first record per key; records without the key are dropped.
pub fn dedup_by_key(records: Vec<Record>, key: &str) -> Vec<Record> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|r| match key_of(r, key) {
            Some(k) => seen.insert(k),
            None => false,
        })
        .collect()
}

/// Appends `incoming` to `existing`, keeping the last record per key in the
/// position of that last occurrence. Keyless records are kept.
pub fn merge_keep_last(existing: Vec<Record>, incoming: Vec<Record>, key: &str) -> Vec<Record> {
    let mut seen = HashSet::new();
    let mut merged: Vec<Record> = existing
        .into_iter()
        .chain(incoming)
        .rev()
        .filter(|r| match key_of(r, key) {
            Some(k) => seen.insert(k),
            None => true,
        })
        .collect();
    merged.reverse();
    merged
}
