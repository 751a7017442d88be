//! Session-based scrape-and-normalize clients for a handful of business portals.
//!
//! [`session::SessionClient`] carries login, CSRF and retry handling for every portal;
//! [`sites`] holds the per-portal clients built on top of it.

pub mod cli;
pub mod config;
pub mod error;
pub mod listing;
pub mod mfa;
pub mod notify;
pub mod retry;
pub mod session;
pub mod sheet;
pub mod sites;
pub mod tabular;
pub mod window;

pub use config::AppSettings;
pub use error::{Result, ScrapeError};
