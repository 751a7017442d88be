//! Fixed-span fetch windows and the persisted "last fetch" cursor.

use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::tabular::{dedup_by_key, Record};

pub const WINDOW_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn default_span() -> TimeDelta {
    TimeDelta::minutes(15)
}

pub fn default_catchup() -> TimeDelta {
    TimeDelta::days(1)
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl Window {
    pub fn start_str(&self) -> String {
        self.start.format(WINDOW_FORMAT).to_string()
    }

    pub fn end_str(&self) -> String {
        self.end.format(WINDOW_FORMAT).to_string()
    }
}

/// Splits `[last, now)` into consecutive windows of at most `span`, never reaching
/// further back than `max_catchup` before `now`.
pub fn plan_windows(
    last: NaiveDateTime,
    now: NaiveDateTime,
    span: TimeDelta,
    max_catchup: TimeDelta,
) -> Vec<Window> {
    if span <= TimeDelta::zero() || last >= now {
        return Vec::new();
    }
    let mut start = last.max(now - max_catchup);
    let mut windows = Vec::new();
    while start < now {
        let end = (start + span).min(now);
        windows.push(Window { start, end });
        start = end;
    }
    windows
}

#[derive(Serialize, Deserialize)]
struct CursorFile {
    last_fetch: String,
}

fn parse_instant(raw: &str) -> Option<NaiveDateTime> {
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            chrono::DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|dt| dt.naive_local())
        })
}

pub fn default_cursor_start() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
}

/// The last instant known to be fetched, kept in a single JSON file.
#[derive(Debug, Clone)]
pub struct FetchCursor {
    path: PathBuf,
    last_fetch: NaiveDateTime,
}

impl FetchCursor {
    /// Missing or unreadable files fall back to `default`.
    pub fn load(path: impl Into<PathBuf>, default: NaiveDateTime) -> Self {
        let path = path.into();
        let last_fetch = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<CursorFile>(&raw)
                .ok()
                .and_then(|f| parse_instant(&f.last_fetch))
            {
                Some(ts) => ts,
                None => {
                    tracing::warn!(path = %path.display(), "Unreadable cursor file, using default");
                    default
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => default,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Could not read cursor file");
                default
            }
        };
        tracing::debug!(path = %path.display(), last_fetch = %last_fetch, "Loaded fetch cursor");
        Self { path, last_fetch }
    }

    pub fn last_fetch(&self) -> NaiveDateTime {
        self.last_fetch
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let file = CursorFile {
            last_fetch: self.last_fetch.format("%Y-%m-%dT%H:%M:%S").to_string(),
        };
        std::fs::write(&self.path, serde_json::to_string_pretty(&file)?)?;
        Ok(())
    }

    /// Moves forward to `to`, capped at `now`. Returns whether the cursor moved.
    pub fn advance(&mut self, to: NaiveDateTime, now: NaiveDateTime) -> bool {
        let target = to.min(now);
        if target <= self.last_fetch {
            return false;
        }
        self.last_fetch = target;
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeRange {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IncrementalMetadata {
    pub total_records: usize,
    pub intervals_processed: usize,
    pub intervals_failed: usize,
    pub cursor_advanced: bool,
    pub time_range: TimeRange,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IncrementalReport {
    pub data: Vec<Record>,
    pub metadata: IncrementalMetadata,
}

/// Window-by-window fetch driven by a [`FetchCursor`].
pub struct IncrementalFetch {
    pub cursor: FetchCursor,
    pub unique_key: String,
    pub span: TimeDelta,
    pub max_catchup: TimeDelta,
}

impl IncrementalFetch {
    pub fn new(cursor: FetchCursor, unique_key: impl Into<String>) -> Self {
        Self {
            cursor,
            unique_key: unique_key.into(),
            span: default_span(),
            max_catchup: default_catchup(),
        }
    }

    /// Fetches every window in order. Failed windows are logged and skipped; the
    /// cursor moves to `now` only when records came back, or on a full refresh
    /// where at least one window succeeded.
    pub async fn run<F, Fut>(
        &mut self,
        now: NaiveDateTime,
        full_refresh: bool,
        mut fetch: F,
    ) -> Result<IncrementalReport>
    where
        F: FnMut(Window) -> Fut,
        Fut: Future<Output = Result<Vec<Record>>>,
    {
        let windows = plan_windows(self.cursor.last_fetch(), now, self.span, self.max_catchup);
        let range_start = windows.first().map(|w| w.start).unwrap_or(now);
        tracing::info!(
            from = %range_start,
            to = %now,
            windows = windows.len(),
            full_refresh,
            "Starting incremental fetch"
        );

        let mut merged = Vec::new();
        let mut failed = 0usize;
        for window in &windows {
            match fetch(*window).await {
                Ok(records) => {
                    tracing::info!(
                        start = %window.start,
                        end = %window.end,
                        records = records.len(),
                        "Fetched window"
                    );
                    merged.extend(records);
                }
                Err(e) => {
                    failed += 1;
                    tracing::warn!(
                        start = %window.start,
                        end = %window.end,
                        error = %e,
                        "Window fetch failed, skipping"
                    );
                }
            }
        }

        let data = dedup_by_key(merged, &self.unique_key);
        let succeeded = windows.len() - failed;
        let should_advance = !data.is_empty() || (full_refresh && succeeded > 0);
        let mut next = self.cursor.clone();
        let cursor_advanced = should_advance && next.advance(now, now);
        if cursor_advanced {
            next.save()?;
            self.cursor = next;
            tracing::info!(last_fetch = %now, path = %self.cursor.path().display(), "Cursor advanced");
        } else {
            tracing::info!(last_fetch = %self.cursor.last_fetch(), "Cursor unchanged");
        }

        Ok(IncrementalReport {
            metadata: IncrementalMetadata {
                total_records: data.len(),
                intervals_processed: windows.len(),
                intervals_failed: failed,
                cursor_advanced,
                time_range: TimeRange {
                    start: range_start.format("%Y-%m-%dT%H:%M:%S").to_string(),
                    end: now.format("%Y-%m-%dT%H:%M:%S").to_string(),
                },
            },
            data,
        })
    }
}
