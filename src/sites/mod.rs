//! Clients for the individual portals, all built on [`crate::session::SessionClient`].

pub mod crm;
pub mod erp;
pub mod jobs;
pub mod neo;

use chrono::{Local, NaiveDateTime};
use scraper::{ElementRef, Selector};
use serde::Serialize;

use crate::error::{Result, ScrapeError};
use crate::window::{Window, WINDOW_FORMAT};

/// Placeholder for fields missing from scraped markup.
pub const NOT_AVAILABLE: &str = "N/A";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DateRangeText {
    pub start: String,
    pub end: String,
}

impl DateRange {
    /// `00:00:00` to `23:59:59` of the local current day.
    pub fn today() -> Self {
        let day = Local::now().date_naive();
        Self {
            start: day.and_hms_opt(0, 0, 0).unwrap_or_default(),
            end: day.and_hms_opt(23, 59, 59).unwrap_or_default(),
        }
    }

    pub fn parse(start: &str, end: &str) -> Result<Self> {
        let parse = |raw: &str| {
            NaiveDateTime::parse_from_str(raw, WINDOW_FORMAT)
                .or_else(|_| {
                    chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                        .map(|d| d.and_hms_opt(0, 0, 0).unwrap_or_default())
                })
                .map_err(|e| ScrapeError::Config(format!("bad date {raw}: {e}")))
        };
        let range = Self {
            start: parse(start)?,
            end: parse(end)?,
        };
        if range.end < range.start {
            return Err(ScrapeError::Config(format!("date range ends before it starts: {start} > {end}")));
        }
        Ok(range)
    }

    pub fn start_str(&self) -> String {
        self.start.format(WINDOW_FORMAT).to_string()
    }

    pub fn end_str(&self) -> String {
        self.end.format(WINDOW_FORMAT).to_string()
    }

    pub fn text(&self) -> DateRangeText {
        DateRangeText {
            start: self.start_str(),
            end: self.end_str(),
        }
    }
}

impl From<Window> for DateRange {
    fn from(w: Window) -> Self {
        Self {
            start: w.start,
            end: w.end,
        }
    }
}

pub(crate) fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| ScrapeError::Markup(format!("bad selector {css}: {e:?}")))
}

/// Whitespace-collapsed text of an element.
pub(crate) fn element_text(el: ElementRef<'_>) -> String {
    el.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Text of the first match under `root`, or `N/A`.
pub(crate) fn first_text(root: ElementRef<'_>, sel: &Selector) -> String {
    root.select(sel)
        .next()
        .map(element_text)
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| NOT_AVAILABLE.to_string())
}
