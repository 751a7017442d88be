//! Sales ERP: contract export plus per-agent daily and weekly counts.

use chrono::{Datelike, Local, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::instrument;

use crate::config::{AppSettings, ErpSite};
use crate::error::{Result, ScrapeError};
use crate::session::{LoginOutcome, SessionClient};
use crate::tabular::{merge_keep_last, normalize_spreadsheet, Record};
use crate::window::WINDOW_FORMAT;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshKind {
    FullRefresh,
    Incremental,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct DailyStat {
    pub commercial: String,
    pub date: NaiveDate,
    pub daily_sales: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct WeeklyStat {
    pub commercial: String,
    pub month: String,
    pub relative_week: u32,
    pub weekly_sales: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContractsReport {
    pub data: Vec<Record>,
    #[serde(rename = "type")]
    pub kind: RefreshKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_records: Option<usize>,
    pub daily_stats: Vec<DailyStat>,
    pub weekly_stats: Vec<WeeklyStat>,
}

/// Accepts the ERP's ISO timestamps and French day-first dates.
pub fn parse_created(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    const DATETIME: &[&str] = &[
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%d/%m/%Y %H:%M:%S",
        "%d/%m/%Y %H:%M",
    ];
    const DATE: &[&str] = &["%Y-%m-%d", "%d/%m/%Y"];
    DATETIME
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(raw, f).ok())
        .or_else(|| {
            DATE.iter()
                .find_map(|f| NaiveDate::parse_from_str(raw, f).ok())
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .or_else(|| {
            chrono::DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|dt| dt.naive_local())
        })
}

fn text_field(record: &Record, column: &str) -> Option<String> {
    match record.get(column)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// `(agent, created)` for records where both are readable.
fn dated_sales<'a>(
    records: &'a [Record],
    agent_column: &'a str,
    created_column: &'a str,
) -> impl Iterator<Item = (String, NaiveDateTime)> + 'a {
    records.iter().filter_map(move |r| {
        let agent = text_field(r, agent_column)?;
        let created = parse_created(&text_field(r, created_column)?)?;
        Some((agent, created))
    })
}

/// Sales per agent per calendar day, sorted by agent then day.
pub fn daily_stats(records: &[Record], agent_column: &str, created_column: &str) -> Vec<DailyStat> {
    let mut counts: BTreeMap<(String, NaiveDate), usize> = BTreeMap::new();
    for (agent, created) in dated_sales(records, agent_column, created_column) {
        *counts.entry((agent, created.date())).or_default() += 1;
    }
    counts
        .into_iter()
        .map(|((commercial, date), daily_sales)| DailyStat {
            commercial,
            date,
            daily_sales,
        })
        .collect()
}

/// Sales per agent per month and week of month (days 1-7 are week 1).
pub fn weekly_stats(records: &[Record], agent_column: &str, created_column: &str) -> Vec<WeeklyStat> {
    let mut counts: BTreeMap<(String, String, u32), usize> = BTreeMap::new();
    for (agent, created) in dated_sales(records, agent_column, created_column) {
        let month = created.format("%Y-%m").to_string();
        let week = (created.day() - 1) / 7 + 1;
        *counts.entry((agent, month, week)).or_default() += 1;
    }
    counts
        .into_iter()
        .map(|((commercial, month, relative_week), weekly_sales)| WeeklyStat {
            commercial,
            month,
            relative_week,
            weekly_sales,
        })
        .collect()
}

/// Increment body: a bare array of objects or one wrapped in `data`.
pub fn parse_increment(body: &[u8]) -> Result<Vec<Record>> {
    let value: Value = serde_json::from_slice(body)?;
    let rows = match value {
        Value::Array(rows) => rows,
        Value::Object(mut obj) => match obj.remove("data") {
            Some(Value::Array(rows)) => rows,
            _ => return Err(ScrapeError::Decode("increment has no data array".into())),
        },
        _ => return Err(ScrapeError::Decode("increment is not a list".into())),
    };
    rows.into_iter()
        .map(|row| match row {
            Value::Object(map) => Ok(map),
            other => Err(ScrapeError::Decode(format!("increment row is not an object: {other}"))),
        })
        .collect()
}

/// Contracts fetched so far and when, kept in one JSON file between runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContractSnapshot {
    #[serde(default)]
    pub last_fetch: Option<NaiveDateTime>,
    #[serde(default)]
    pub records: Vec<Record>,
}

impl ContractSnapshot {
    /// Missing or unreadable files give an empty snapshot, which forces a full export.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "Unreadable contract snapshot, starting empty");
                Self::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Could not read contract snapshot");
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, serde_json::to_string(self)?)?;
        Ok(())
    }
}

pub struct ErpClient {
    site: ErpSite,
    session: SessionClient,
    snapshot: ContractSnapshot,
    state_path: Option<PathBuf>,
}

impl ErpClient {
    pub fn new(settings: &AppSettings) -> Result<Self> {
        let site = settings.erp_site()?.clone();
        let session = SessionClient::new(site.portal.clone(), settings)?;
        let state_path = site.state_path.clone();
        let snapshot = state_path
            .as_deref()
            .map(ContractSnapshot::load)
            .unwrap_or_default();
        tracing::debug!(
            stored = snapshot.records.len(),
            last_fetch = ?snapshot.last_fetch,
            "Loaded contract snapshot"
        );
        Ok(Self {
            site,
            session,
            snapshot,
            state_path,
        })
    }

    pub fn snapshot(&self) -> &ContractSnapshot {
        &self.snapshot
    }

    /// Persists `next` before it replaces the in-memory snapshot.
    fn commit(&mut self, next: ContractSnapshot) -> Result<()> {
        if let Some(path) = &self.state_path {
            next.save(path)?;
            tracing::debug!(path = %path.display(), stored = next.records.len(), "Saved contract snapshot");
        }
        self.snapshot = next;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn login(&self) -> Result<()> {
        match self.session.login().await? {
            LoginOutcome::Authenticated => Ok(()),
            LoginOutcome::MfaRequired(url) => Err(ScrapeError::Auth(format!(
                "unexpected second factor at {url}"
            ))),
        }
    }

    fn refresh_xsrf_header(&self) -> Result<()> {
        let token = self.session.csrf_token();
        match (&self.site.portal.login.csrf_header, token.is_empty()) {
            (Some(header), false) => self.session.set_header(header, &token),
            _ => Ok(()),
        }
    }

    async fn get_checked(&self, path: &str, query: &[(String, String)]) -> Result<Vec<u8>> {
        self.refresh_xsrf_header()?;
        let resp = self.session.get_query(&self.session.url(path), query).await?;
        Ok(self.session.check(resp)?.body)
    }

    async fn full_refresh(&mut self) -> Result<usize> {
        tracing::info!("Fetching full contract export");
        let path = self.site.export_path.clone();
        let body = self
            .session
            .protected(|| self.get_checked(&path, &[]))
            .await?;
        let table = normalize_spreadsheet(&body).inspect_err(|_| {
            self.session.dump_debug("erp_export", &body);
        })?;
        let count = table.records.len();
        self.commit(ContractSnapshot {
            last_fetch: Some(Local::now().naive_local()),
            records: table.records,
        })?;
        Ok(count)
    }

    async fn fetch_increment(&self, since: NaiveDateTime) -> Result<Vec<Record>> {
        let query = vec![("start_date".to_string(), since.format(WINDOW_FORMAT).to_string())];
        let path = &self.site.increment_path;
        let body = self
            .session
            .protected(|| self.get_checked(path, &query))
            .await?;
        parse_increment(&body)
    }

    /// Full export when nothing was fetched before or when forced; afterwards only
    /// contracts created since the previous fetch, merged by id. The previous fetch
    /// comes from the snapshot file when one is configured. An unreadable increment
    /// triggers a full refresh.
    #[instrument(skip(self))]
    pub async fn contracts(&mut self, force_full_refresh: bool) -> Result<ContractsReport> {
        let previous = self.snapshot.last_fetch;
        let (kind, new_records) = match previous {
            Some(since) if !force_full_refresh => match self.fetch_increment(since).await {
                Ok(rows) => {
                    let added = rows.len();
                    let records =
                        merge_keep_last(self.snapshot.records.clone(), rows, &self.site.id_column);
                    let total = records.len();
                    self.commit(ContractSnapshot {
                        last_fetch: Some(Local::now().naive_local()),
                        records,
                    })?;
                    tracing::info!(new = added, total, "Merged contract increment");
                    (RefreshKind::Incremental, Some(added))
                }
                Err(e) if matches!(e, ScrapeError::Json(_) | ScrapeError::Decode(_)) => {
                    tracing::warn!(error = %e, "Increment unreadable, falling back to full refresh");
                    self.full_refresh().await?;
                    (RefreshKind::FullRefresh, None)
                }
                Err(e) => return Err(e),
            },
            _ => {
                self.full_refresh().await?;
                (RefreshKind::FullRefresh, None)
            }
        };

        Ok(ContractsReport {
            daily_stats: self.daily_stats(),
            weekly_stats: self.weekly_stats(),
            data: self.snapshot.records.clone(),
            kind,
            new_records,
        })
    }

    pub fn daily_stats(&self) -> Vec<DailyStat> {
        daily_stats(&self.snapshot.records, &self.site.agent_column, &self.site.created_column)
    }

    pub fn weekly_stats(&self) -> Vec<WeeklyStat> {
        weekly_stats(&self.snapshot.records, &self.site.agent_column, &self.site.created_column)
    }
}
