use anyhow::{anyhow, Context};
use chrono::Local;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

use portal_scrape::cli::{self, CodeSourceKind, Command, Params, Parsed};
use portal_scrape::mfa::{MfaCodeSource, PromptCodeSource};
use portal_scrape::notify::TelegramNotifier;
use portal_scrape::sheet::{export_to_sheet, CsvSheet};
use portal_scrape::sites::crm::{CrmClient, QualifKind, SearchQuery};
use portal_scrape::sites::erp::ErpClient;
use portal_scrape::sites::jobs::{JobsClient, CANDIDATE_COLUMNS};
use portal_scrape::sites::neo::{ContractQuery, NeoClient};
use portal_scrape::AppSettings;

const DEFAULT_PAGE_SIZE: usize = 100;

/// JSON printed on stdout plus the one-line summary sent to the chat.
struct Outcome {
    value: Value,
    summary: String,
}

impl Outcome {
    fn new<T: Serialize>(value: &T, summary: String) -> anyhow::Result<Self> {
        Ok(Self {
            value: serde_json::to_value(value)?,
            summary,
        })
    }
}

/// Explicit `--site`, otherwise the alphabetically first configured account.
fn account<T>(accounts: &HashMap<String, T>, wanted: Option<&str>, kind: &str) -> anyhow::Result<String> {
    if let Some(name) = wanted {
        return Ok(name.to_string());
    }
    let mut names: Vec<&String> = accounts.keys().collect();
    names.sort();
    names
        .first()
        .map(|n| n.to_string())
        .ok_or_else(|| anyhow!("no {kind} account configured"))
}

async fn run(
    params: &Params,
    settings: &AppSettings,
    notifier: Option<&TelegramNotifier>,
) -> anyhow::Result<Outcome> {
    match params.command {
        Command::CrmCampaigns => {
            let name = account(&settings.crm, params.site.as_deref(), "crm")?;
            let client = CrmClient::new(&name, settings)?;
            client.login().await?;
            let range = params.date_range()?;
            let campaigns = client.campaigns(&range).await?;
            let qualifications = if params.qualifs {
                let group = &settings.crm_site(&name)?.campaign_group;
                Some(client.qualifications(&campaigns.ids(group)).await?)
            } else {
                None
            };
            let summary = format!("{name}: {} campaigns", campaigns.option_count());
            Outcome::new(
                &json!({ "campaigns": campaigns, "qualifications": qualifications, "date_range": range.text() }),
                summary,
            )
        }
        Command::CrmSearch => {
            let name = account(&settings.crm, params.site.as_deref(), "crm")?;
            let client = CrmClient::new(&name, settings)?;
            client.login().await?;
            let qualif_kinds = params
                .qualif_kinds
                .iter()
                .map(|k| QualifKind::parse(k).ok_or_else(|| anyhow!("Unknown qualification kind: {k}")))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let query = SearchQuery {
                range: Some(params.date_range()?),
                qualif_kinds,
                ..SearchQuery::default()
            };
            let result = client.search(query).await?;
            let summary = format!("{name}: {} of {} search rows", result.data.len(), result.total);
            Outcome::new(&result, summary)
        }
        Command::CrmExport => {
            let name = account(&settings.crm, params.site.as_deref(), "crm")?;
            let client = CrmClient::new(&name, settings)?;
            client.login().await?;
            let range = params.date_range()?;
            match params.page {
                Some(page) => {
                    let size = params.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
                    let page = client.export_page(&range, page, size).await?;
                    let summary = format!(
                        "{name}: page {}/{} of {} exported records",
                        page.page, page.total_pages, page.total_records
                    );
                    Outcome::new(&page, summary)
                }
                None => {
                    let table = client.export(&range).await?;
                    let summary = format!("{name}: {} exported records", table.len());
                    Outcome::new(&table, summary)
                }
            }
        }
        Command::CrmIncremental => {
            let name = account(&settings.crm, params.site.as_deref(), "crm")?;
            let client = CrmClient::new(&name, settings)?;
            client.login().await?;
            let report = client
                .incremental(Local::now().naive_local(), params.full_refresh)
                .await?;
            let meta = &report.metadata;
            let summary = format!(
                "{name}: {} new records over {} windows ({} failed), cursor {}",
                meta.total_records,
                meta.intervals_processed,
                meta.intervals_failed,
                if meta.cursor_advanced { "advanced" } else { "unchanged" }
            );
            Outcome::new(&report, summary)
        }
        Command::ErpContracts => {
            let mut client = ErpClient::new(settings)?;
            client.login().await?;
            let report = client.contracts(params.full_refresh).await?;
            let summary = format!(
                "ERP: {} contracts, {} agent-days",
                report.data.len(),
                report.daily_stats.len()
            );
            Outcome::new(&report, summary)
        }
        Command::Jobs => {
            let name = account(&settings.jobs, params.site.as_deref(), "jobs")?;
            let client = JobsClient::new(&name, settings)?;
            client.login().await?;
            let listing = client.jobs(params.company.as_deref()).await?;
            let summary = format!("{name}: {} job offers", listing.jobs.len());
            Outcome::new(&listing, summary)
        }
        Command::JobsDuplicate => {
            let name = account(&settings.jobs, params.site.as_deref(), "jobs")?;
            let client = JobsClient::new(&name, settings)?;
            client.login().await?;
            let company = params
                .company
                .clone()
                .unwrap_or_else(|| client.company().to_string());
            let outcome = client.duplicate_random_job(&company).await?;
            let summary = format!("{name}: {}", outcome.message);
            Outcome::new(&outcome, summary)
        }
        Command::Candidatures => {
            let name = account(&settings.jobs, params.site.as_deref(), "jobs")?;
            let client = JobsClient::new(&name, settings)?;
            client.login().await?;
            let candidates = client.candidatures().await?;

            let sheet = match &params.sheet {
                Some(path) => {
                    let mut sink = CsvSheet::new(path);
                    let records: Vec<_> = candidates.iter().map(|c| c.to_record()).collect();
                    let columns: Vec<String> = CANDIDATE_COLUMNS.iter().map(|c| c.to_string()).collect();
                    Some(export_to_sheet(&mut sink, &records, &columns, "candidature_id").await?)
                }
                None => None,
            };
            let cvs = if params.download_cvs {
                client.download_cvs(&candidates).await
            } else {
                Vec::new()
            };

            let summary = format!(
                "{name}: {} candidates, {} appended to sheet, {} CVs downloaded",
                candidates.len(),
                sheet.as_ref().map_or(0, |s| s.appended),
                cvs.iter().filter(|d| !d.skipped).count()
            );
            Outcome::new(
                &json!({ "candidates": candidates, "sheet": sheet, "cvs": cvs }),
                summary,
            )
        }
        Command::NeoContracts => {
            let codes: Arc<dyn MfaCodeSource> = match params.mfa {
                CodeSourceKind::Prompt => Arc::new(PromptCodeSource),
                CodeSourceKind::Telegram => Arc::new(
                    notifier
                        .cloned()
                        .ok_or_else(|| anyhow!("--mfa telegram needs a [telegram] section"))?,
                ),
            };
            let client = NeoClient::new(settings, codes)?;
            let range = match (&params.start, &params.end) {
                (None, None) => None,
                _ => Some(params.date_range()?),
            };
            let (page, limit) = params.paging()?;
            let query = ContractQuery { range, page, limit };
            let page = client.contracts(query).await?;
            let summary = format!(
                "Neo: {} contracts on page {} of {}",
                page.data.len(),
                page.pagination.current_page,
                page.pagination.total_pages
            );
            Outcome::new(&page, summary)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_level(true)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    let params = match cli::parse_args(std::env::args().skip(1))? {
        Parsed::Help => {
            eprintln!("{}", cli::HELP);
            return Ok(());
        }
        Parsed::Run(params) => params,
    };

    let settings = AppSettings::load(params.config.as_deref()).context("loading settings")?;
    let notifier = TelegramNotifier::from_settings(&settings);

    let start = Instant::now();
    tracing::info!(command = ?params.command, "Starting run");
    let outcome = run(&params, &settings, notifier.as_ref()).await;

    match &outcome {
        Ok(o) => {
            tracing::info!(total_duration = ?start.elapsed(), summary = %o.summary, "Run completed");
            if let Some(bot) = &notifier {
                bot.notify(&format!("{}\nDuration: {:?}", o.summary, start.elapsed()))
                    .await;
            }
        }
        Err(e) => {
            tracing::error!(error = %e, total_duration = ?start.elapsed(), "Run failed");
            if let Some(bot) = &notifier {
                bot.notify(&format!("{:?} failed: {e:#}", params.command)).await;
            }
        }
    }

    let outcome = outcome?;
    println!("{}", serde_json::to_string_pretty(&outcome.value)?);
    Ok(())
}
