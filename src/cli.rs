use anyhow::{anyhow, bail, Context};
use std::path::PathBuf;

use crate::sites::DateRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    CrmCampaigns,
    CrmSearch,
    CrmExport,
    CrmIncremental,
    ErpContracts,
    Jobs,
    JobsDuplicate,
    Candidatures,
    NeoContracts,
}

impl Command {
    fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "crm-campaigns" => Self::CrmCampaigns,
            "crm-search" => Self::CrmSearch,
            "crm-export" => Self::CrmExport,
            "crm-incremental" => Self::CrmIncremental,
            "erp-contracts" => Self::ErpContracts,
            "jobs" => Self::Jobs,
            "jobs-duplicate" => Self::JobsDuplicate,
            "candidatures" => Self::Candidatures,
            "neo-contracts" => Self::NeoContracts,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodeSourceKind {
    #[default]
    Prompt,
    Telegram,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Params {
    pub command: Command,
    pub config: Option<PathBuf>,
    pub site: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub page: Option<usize>,
    pub page_size: Option<usize>,
    pub full_refresh: bool,
    pub company: Option<String>,
    pub qualifs: bool,
    pub qualif_kinds: Vec<String>,
    pub sheet: Option<PathBuf>,
    pub download_cvs: bool,
    pub mfa: CodeSourceKind,
}

pub enum Parsed {
    Run(Params),
    Help,
}

pub const HELP: &str = include_str!("cli_help.txt");

impl Params {
    fn new(command: Command) -> Self {
        Self {
            command,
            config: None,
            site: None,
            start: None,
            end: None,
            page: None,
            page_size: None,
            full_refresh: false,
            company: None,
            qualifs: false,
            qualif_kinds: Vec::new(),
            sheet: None,
            download_cvs: false,
            mfa: CodeSourceKind::default(),
        }
    }

    /// `--start/--end`, each defaulting to the edge of the current day.
    pub fn date_range(&self) -> anyhow::Result<DateRange> {
        let today = DateRange::today();
        let start = self.start.clone().unwrap_or_else(|| today.start_str());
        let end = self.end.clone().unwrap_or_else(|| match &self.start {
            Some(s) if s.len() == 10 => format!("{s} 23:59:59"),
            _ => today.end_str(),
        });
        let end = if end.len() == 10 { format!("{end} 23:59:59") } else { end };
        Ok(DateRange::parse(&start, &end)?)
    }

    /// `--page` and `--page-size` as the extranet's 32-bit paging; page defaults to 1,
    /// size to 0 (the configured limit).
    pub fn paging(&self) -> anyhow::Result<(u32, u32)> {
        let page = u32::try_from(self.page.unwrap_or(1))
            .with_context(|| format!("Page out of range: {:?}", self.page))?;
        let size = u32::try_from(self.page_size.unwrap_or(0))
            .with_context(|| format!("Page size out of range: {:?}", self.page_size))?;
        Ok((page, size))
    }
}

/// Parses arguments without the program name.
pub fn parse_args<I>(args: I) -> anyhow::Result<Parsed>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    let first = match args.next() {
        None => return Ok(Parsed::Help),
        Some(a) if a == "-h" || a == "--help" => return Ok(Parsed::Help),
        Some(a) => a,
    };
    let command = Command::parse(&first).ok_or_else(|| anyhow!("Unknown command: {first}"))?;
    let mut params = Params::new(command);

    while let Some(a) = args.next() {
        let mut value = |flag: &str| args.next().ok_or_else(|| anyhow!("Missing value for {flag}"));
        match a.as_str() {
            "-c" | "--config" => params.config = Some(PathBuf::from(value("--config")?)),
            "-s" | "--site" => params.site = Some(value("--site")?),
            "--start" => params.start = Some(value("--start")?),
            "--end" => params.end = Some(value("--end")?),
            "--page" => {
                let v = value("--page")?;
                params.page = Some(v.parse().with_context(|| format!("Bad page: {v}"))?);
            }
            "--page-size" => {
                let v = value("--page-size")?;
                params.page_size = Some(v.parse().with_context(|| format!("Bad page size: {v}"))?);
            }
            "--company" => params.company = Some(value("--company")?),
            "--qualif-kinds" => {
                params.qualif_kinds = value("--qualif-kinds")?
                    .split(',')
                    .map(str::trim)
                    .filter(|k| !k.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            "--sheet" => params.sheet = Some(PathBuf::from(value("--sheet")?)),
            "--mfa" => {
                let v = value("--mfa")?;
                params.mfa = match v.to_ascii_lowercase().as_str() {
                    "prompt" => CodeSourceKind::Prompt,
                    "telegram" => CodeSourceKind::Telegram,
                    other => bail!("Unknown code source: {other}"),
                };
            }
            "--full-refresh" => params.full_refresh = true,
            "--qualifs" => params.qualifs = true,
            "--download-cvs" => params.download_cvs = true,
            "-h" | "--help" => return Ok(Parsed::Help),
            _ => bail!("Unknown arg: {a}"),
        }
    }
    Ok(Parsed::Run(params))
}
