use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, ScrapeError};
use crate::mfa::{MfaFlow, DEFAULT_CODE_WAIT};

const DEFAULTS: &str = include_str!("defaults.toml");
const USER_FILE: &str = "portal_scrape";

#[derive(Deserialize, Clone, Debug)]
pub struct AppSettings {
    pub cursor_path: PathBuf,
    #[serde(default)]
    pub debug_dir: Option<PathBuf>,
    pub cv_dir: PathBuf,
    pub cv_log: PathBuf,
    #[serde(default)]
    pub proxies: Vec<String>,
    pub retry: RetrySettings,
    #[serde(default)]
    pub telegram: Option<TelegramSettings>,
    #[serde(default)]
    pub crm: HashMap<String, CrmSite>,
    #[serde(default)]
    pub erp: Option<ErpSite>,
    #[serde(default)]
    pub jobs: HashMap<String, JobsSite>,
    #[serde(default)]
    pub neo: Option<NeoSite>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub delay_ms: u64,
    pub timeout_secs: u64,
}

#[derive(Deserialize, Clone, Debug)]
pub struct TelegramSettings {
    pub token: String,
    pub chat_id: i64,
}

/// A header or form field; kept as a list because map keys are case-folded by the loader.
#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct NamedValue {
    pub name: String,
    pub value: String,
}

/// Everything the generic session client needs to talk to one portal.
#[derive(Deserialize, Clone, Debug)]
pub struct PortalConfig {
    pub base_url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub account: String,
    #[serde(default)]
    pub headers: Vec<NamedValue>,
    pub login: LoginFlow,
    #[serde(default)]
    pub probe_path: Option<String>,
    #[serde(default)]
    pub login_markers: Vec<String>,
    #[serde(default)]
    pub min_interval_ms: u64,
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

#[derive(Deserialize, Clone, Debug)]
pub struct LoginFlow {
    #[serde(default)]
    pub token_path: Option<String>,
    #[serde(default)]
    pub csrf_cookie: Option<String>,
    #[serde(default)]
    pub csrf_header: Option<String>,
    pub post_path: String,
    #[serde(default)]
    pub fields: Vec<NamedValue>,
    #[serde(default)]
    pub headers: Vec<NamedValue>,
    #[serde(default)]
    pub mfa_marker: Option<String>,
    #[serde(default)]
    pub verify: bool,
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct QualifCategories {
    #[serde(default)]
    pub sales: Vec<String>,
    #[serde(default)]
    pub callback: Vec<String>,
    #[serde(default)]
    pub rejection: Vec<String>,
    #[serde(default)]
    pub rejection_prefixes: Vec<String>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct CrmSite {
    pub portal: PortalConfig,
    pub campaign_group: String,
    pub export_model: String,
    pub unique_key: String,
    pub delimiter: String,
    #[serde(default)]
    pub qualif_filter: Vec<String>,
    pub filter_path: String,
    pub search_path: String,
    pub qualifs_path: String,
    #[serde(default)]
    pub categories: QualifCategories,
}

#[derive(Deserialize, Clone, Debug)]
pub struct ErpSite {
    pub portal: PortalConfig,
    pub export_path: String,
    pub increment_path: String,
    pub id_column: String,
    pub created_column: String,
    pub agent_column: String,
    /// Contracts kept between runs; without it only a long-lived client fetches increments.
    #[serde(default)]
    pub state_path: Option<PathBuf>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct JobsSite {
    pub portal: PortalConfig,
    pub desk: PortalConfig,
    pub company: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct NeoSite {
    pub portal: PortalConfig,
    pub search_path: String,
    pub date_format: String,
    pub page_limit: u32,
    #[serde(default = "default_mfa_wait_secs")]
    pub mfa_wait_secs: u64,
    pub mfa: MfaFlow,
}

impl AppSettings {
    /// Layers built-in portal definitions, an optional user file and `PORTAL__*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            Config::builder().add_source(File::from_str(DEFAULTS, FileFormat::Toml));

        builder = match path {
            Some(p) => builder.add_source(File::from(p.to_path_buf()).required(true)),
            None => builder.add_source(File::with_name(USER_FILE).required(false)),
        };

        let settings: AppSettings = builder
            .add_source(
                Environment::with_prefix("PORTAL")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("proxies"),
            )
            .build()?
            .try_deserialize()?;

        tracing::debug!(
            crm = settings.crm.len(),
            jobs = settings.jobs.len(),
            proxies = settings.proxies.len(),
            "Loaded settings"
        );
        Ok(settings)
    }

    pub fn crm_site(&self, name: &str) -> Result<&CrmSite> {
        self.crm
            .get(name)
            .ok_or_else(|| ScrapeError::Config(format!("no crm portal named {name}")))
    }

    pub fn jobs_site(&self, name: &str) -> Result<&JobsSite> {
        self.jobs
            .get(name)
            .ok_or_else(|| ScrapeError::Config(format!("no jobs portal named {name}")))
    }

    pub fn erp_site(&self) -> Result<&ErpSite> {
        self.erp
            .as_ref()
            .ok_or_else(|| ScrapeError::Config("erp portal not configured".into()))
    }

    pub fn neo_site(&self) -> Result<&NeoSite> {
        self.neo
            .as_ref()
            .ok_or_else(|| ScrapeError::Config("neo portal not configured".into()))
    }
}

impl RetrySettings {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl PortalConfig {
    pub fn require_credentials(&self) -> Result<()> {
        if self.username.is_empty() || self.password.is_empty() {
            return Err(ScrapeError::Config(format!(
                "missing credentials for {}",
                self.base_url
            )));
        }
        Ok(())
    }

    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    /// Substitutes `{username}`, `{password}`, `{account}` and `{csrf}` in a template.
    pub fn render(&self, template: &str, csrf: &str) -> String {
        template
            .replace("{username}", &self.username)
            .replace("{password}", &self.password)
            .replace("{account}", &self.account)
            .replace("{csrf}", csrf)
    }
}

fn default_mfa_wait_secs() -> u64 {
    DEFAULT_CODE_WAIT.as_secs()
}

impl NeoSite {
    pub fn mfa_wait(&self) -> Duration {
        Duration::from_secs(self.mfa_wait_secs)
    }
}

impl CrmSite {
    pub fn delimiter_byte(&self) -> u8 {
        self.delimiter.bytes().next().unwrap_or(b';')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_portals_load_without_user_file() {
        let settings = AppSettings::load(None).expect("defaults parse");
        assert!(settings.crm.contains_key("ringassur"));
        assert!(settings.crm.contains_key("formaexpert"));
        assert!(settings.jobs.contains_key("xpercia"));
        assert_eq!(settings.retry.max_attempts, 3);

        let crm = settings.crm_site("ringassur").unwrap();
        assert_eq!(crm.delimiter_byte(), b';');
        assert_eq!(crm.unique_key, "CMK_S_FIELD_ID_UNIQUE");
        let field = &crm.portal.login.fields[5];
        assert_eq!(field.name, "checkForTwoFactor");

        let erp = settings.erp_site().unwrap();
        assert_eq!(erp.created_column, "Créer le");
        assert_eq!(erp.portal.login.csrf_cookie.as_deref(), Some("XSRF-TOKEN"));

        let neo = settings.neo_site().unwrap();
        assert_eq!(neo.mfa_wait(), DEFAULT_CODE_WAIT);
        assert_eq!(neo.page_limit, 20);
    }

    #[test]
    fn render_fills_placeholders() {
        let settings = AppSettings::load(None).unwrap();
        let mut portal = settings.neo_site().unwrap().portal.clone();
        portal.username = "agent".into();
        portal.password = "secret".into();
        assert_eq!(portal.render("{username}:{password}:{csrf}", "tok"), "agent:secret:tok");
        assert_eq!(portal.url("/dashboard"), "https://extranet.neoliane.fr/dashboard");
        assert_eq!(portal.url("https://other/x"), "https://other/x");
        assert!(portal.require_credentials().is_ok());
    }
}
