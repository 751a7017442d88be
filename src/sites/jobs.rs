//! Job board (recruiter site plus the applicant desk).

use rand::seq::IndexedRandom;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, REFERER};
use scraper::{ElementRef, Html};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::instrument;

use super::{element_text, first_text, selector, NOT_AVAILABLE};
use crate::config::{AppSettings, JobsSite};
use crate::error::{Result, ScrapeError};
use crate::session::{LoginOutcome, SessionClient};
use crate::tabular::Record;

static DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{2}-\d{2}-\d{4})").expect("static pattern"));
static APPLICATIONS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Nbr candidatures\s*:\s*(\d+)").expect("static pattern"));
static PAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"page=(\d+)").expect("static pattern"));
static ENTRIES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s+candidatures").expect("static pattern"));
static CANDIDATURE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/candidature/id-(\d+)").expect("static pattern"));
static FILENAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"filename=(.+)").expect("static pattern"));

const CANDIDATURES_PATH: &str = "/candidatures/?";
const DUPLICATE_PATH: &str = "/components/offre/duplioffre.php";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobLink {
    pub id: String,
    pub title: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStats {
    pub applications: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobDetails {
    pub title: String,
    pub company: String,
    pub url: String,
    pub date: String,
    pub location: String,
    pub languages: Vec<String>,
    pub stats: JobStats,
    pub sections: BTreeMap<String, String>,
    pub can_duplicate: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobsListing {
    pub total: usize,
    pub jobs: Vec<JobDetails>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Pagination {
    pub current_page: u32,
    pub last_page: Option<u32>,
    pub total_entries: Option<u64>,
}

/// Sheet layout for [`Candidate`] rows, keyed on `candidature_id`.
pub const CANDIDATE_COLUMNS: &[&str] = &[
    "candidature_id",
    "name",
    "email",
    "phone",
    "city",
    "experience",
    "gender",
    "titre_annonce",
    "cv",
    "date",
    "time",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub candidature_id: String,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub city: String,
    pub experience: String,
    pub gender: String,
    pub titre_annonce: String,
    pub cv: String,
    pub date: String,
    pub time: String,
}

impl Candidate {
    fn is_blank(&self) -> bool {
        [
            &self.name,
            &self.email,
            &self.phone,
            &self.city,
            &self.experience,
            &self.gender,
            &self.titre_annonce,
            &self.cv,
            &self.date,
            &self.time,
        ]
        .iter()
        .all(|v| v.as_str() == NOT_AVAILABLE || v.is_empty())
    }

    pub fn to_record(&self) -> Record {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Record::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicationOutcome {
    pub success: bool,
    pub message: String,
    pub job: Option<JobLink>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CvDownload {
    pub url: String,
    pub path: Option<PathBuf>,
    pub skipped: bool,
}

fn join_url(base: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }
    let base = base.trim_end_matches('/');
    if href.starts_with('/') {
        format!("{base}{href}")
    } else {
        format!("{base}/{href}")
    }
}

/// Offer links on a company's listing page.
pub fn parse_job_links(html: &str, base_url: &str) -> Result<Vec<JobLink>> {
    let doc = Html::parse_document(html);
    let offer = selector("div.offres")?;
    let link = selector("h2 a")?;
    Ok(doc
        .select(&offer)
        .filter_map(|div| {
            let a = div.select(&link).next()?;
            let href = a.value().attr("href").filter(|h| !h.is_empty())?;
            Some(JobLink {
                id: href.rsplit('-').next().unwrap_or_default().to_string(),
                title: element_text(a),
                url: join_url(base_url, href),
            })
        })
        .collect())
}

fn labelled_span<'a>(doc: &'a Html, needle: &dyn Fn(&str) -> bool) -> Result<Option<ElementRef<'a>>> {
    let span = selector("span")?;
    Ok(doc.select(&span).find(|s| needle(&element_text(*s))))
}

/// One offer page. Missing pieces fall back to `N/A` or empty values.
pub fn parse_job_details(html: &str, url: &str) -> Result<JobDetails> {
    let doc = Html::parse_document(html);
    let root = doc.root_element();

    let title = first_text(root, &selector("h1")?);
    let company = first_text(root, &selector("h2 a")?);

    let meta = labelled_span(&doc, &|t| DATE_RE.is_match(t))?.map(element_text);
    let (date, location) = match meta {
        Some(text) => {
            let date = DATE_RE
                .captures(&text)
                .and_then(|c| chrono::NaiveDate::parse_from_str(&c[1], "%d-%m-%Y").ok())
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_else(|| NOT_AVAILABLE.to_string());
            let location = text.rsplit(" - ").next().unwrap_or(NOT_AVAILABLE).trim().to_string();
            (date, location)
        }
        None => (NOT_AVAILABLE.to_string(), NOT_AVAILABLE.to_string()),
    };

    let applications = doc
        .select(&selector("i.badge")?)
        .next()
        .and_then(|b| APPLICATIONS_RE.captures(&element_text(b)).map(|c| c[1].to_string()))
        .and_then(|n| n.parse().ok())
        .unwrap_or(0);

    let mut sections = BTreeMap::new();
    let mut pending: Option<String> = None;
    for el in doc.select(&selector("h3, p")?) {
        match el.value().name() {
            "h3" => pending = Some(element_text(el)),
            _ => {
                if let Some(heading) = pending.take() {
                    sections.insert(heading, element_text(el));
                }
            }
        }
    }

    let anchor = selector("a")?;
    let languages = labelled_span(&doc, &|t| t.contains("Langue(s)"))?
        .map(|span| {
            span.select(&anchor)
                .map(|a| element_text(a).trim_matches(|c| c == '#' || c == ' ').to_string())
                .filter(|l| !l.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let can_duplicate = doc
        .select(&selector(r#"a.duplioffre[href="javascript:void(0)"]"#)?)
        .next()
        .is_some();

    Ok(JobDetails {
        title,
        company,
        url: url.to_string(),
        date,
        location,
        languages,
        stats: JobStats { applications },
        sections,
        can_duplicate,
    })
}

pub fn parse_pagination(html: &str) -> Result<Pagination> {
    let doc = Html::parse_document(html);
    let last_page = doc
        .select(&selector("a[href]")?)
        .filter_map(|a| a.value().attr("href"))
        .filter_map(|href| PAGE_RE.captures(href)?[1].parse::<u32>().ok())
        .max();
    let total_entries = doc
        .select(&selector("h3")?)
        .next()
        .and_then(|h| ENTRIES_RE.captures(&element_text(h))?[1].parse().ok());
    Ok(Pagination {
        current_page: 1,
        last_page,
        total_entries,
    })
}

/// `/candidature/id-N` paths on a listing page, first occurrence order.
pub fn parse_candidature_ids(html: &str) -> Result<Vec<String>> {
    let doc = Html::parse_document(html);
    let mut seen = HashSet::new();
    Ok(doc
        .select(&selector("a[href]")?)
        .filter_map(|a| a.value().attr("href"))
        .filter_map(|href| CANDIDATURE_RE.find(href).map(|m| m.as_str().to_string()))
        .filter(|id| seen.insert(id.clone()))
        .collect())
}

/// Value assigned by `$('#FIELD').val('x')` in the page scripts.
pub fn js_assigned_value(html: &str, field: &str) -> String {
    let pattern = format!(
        r#"\$\s*\(\s*['"]#{}['"]\s*\)\s*\.\s*val\s*\(\s*['"]([^'"]+)['"]\s*\)"#,
        regex::escape(field)
    );
    Regex::new(&pattern)
        .ok()
        .and_then(|re| re.captures(html).map(|c| c[1].to_string()))
        .unwrap_or_else(|| NOT_AVAILABLE.to_string())
}

/// Applicant page. `None` when nothing recognisable is on it.
pub fn parse_candidate(html: &str, candidature_id: &str, desk_url: &str) -> Result<Option<Candidate>> {
    let doc = Html::parse_document(html);
    let input = |name: &str| -> Result<String> {
        let sel = selector(&format!(r#"input[name="{name}"]"#))?;
        Ok(doc
            .select(&sel)
            .next()
            .and_then(|i| i.value().attr("value"))
            .map(|v| v.trim().to_string())
            .unwrap_or_else(|| NOT_AVAILABLE.to_string()))
    };

    let received = doc
        .select(&selector("h3.box-title")?)
        .map(element_text)
        .find(|t| t.contains("Candidature reçue le"));
    let (date, time) = received
        .as_deref()
        .and_then(|t| t.split_once(" le "))
        .map(|(_, rest)| {
            let mut parts = rest.split_whitespace();
            (
                parts.next().unwrap_or(NOT_AVAILABLE).to_string(),
                parts.next().unwrap_or(NOT_AVAILABLE).to_string(),
            )
        })
        .unwrap_or_else(|| (NOT_AVAILABLE.to_string(), NOT_AVAILABLE.to_string()));

    let cv = doc
        .select(&selector("a#cvlink")?)
        .next()
        .and_then(|a| a.value().attr("href"))
        .map(|href| join_url(desk_url, href))
        .unwrap_or_else(|| NOT_AVAILABLE.to_string());

    let titre_annonce = doc
        .select(&selector("section.content-header small")?)
        .next()
        .map(element_text)
        .unwrap_or_else(|| NOT_AVAILABLE.to_string());

    let name = [input("NOM")?, input("PRENOM")?]
        .into_iter()
        .filter(|part| part != NOT_AVAILABLE && !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    let candidate = Candidate {
        candidature_id: candidature_id.to_string(),
        name: if name.is_empty() { NOT_AVAILABLE.to_string() } else { name },
        email: input("EMAIL")?,
        phone: input("TEL")?,
        city: js_assigned_value(html, "VILLE"),
        experience: js_assigned_value(html, "EXPERIENCE"),
        gender: js_assigned_value(html, "SEXE"),
        titre_annonce,
        cv,
        date,
        time,
    };
    Ok((!candidate.is_blank()).then_some(candidate))
}

/// File name from a `Content-Disposition` header, else the last URL segment.
pub fn cv_file_name(content_disposition: Option<&str>, url: &str) -> String {
    let raw = content_disposition
        .and_then(|cd| FILENAME_RE.captures(cd).map(|c| c[1].trim().trim_matches('"').to_string()))
        .unwrap_or_else(|| {
            url.split('?')
                .next()
                .unwrap_or(url)
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_string()
        });
    let name = Path::new(&raw)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if name.is_empty() {
        "cv.bin".to_string()
    } else {
        name
    }
}

/// Append-only list of CV URLs already fetched.
#[derive(Debug, Clone)]
pub struct DownloadLog {
    path: PathBuf,
}

impl DownloadLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn entries(&self) -> Result<HashSet<String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => Ok(raw
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashSet::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn contains(&self, url: &str) -> Result<bool> {
        Ok(self.entries()?.contains(url))
    }

    pub fn record(&self, url: &str) -> Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)?;
        writeln!(file, "{url}")?;
        Ok(())
    }
}

pub struct JobsClient {
    site: JobsSite,
    main: SessionClient,
    desk: SessionClient,
    cv_dir: PathBuf,
    cv_log: DownloadLog,
}

impl JobsClient {
    pub fn new(name: &str, settings: &AppSettings) -> Result<Self> {
        let site = settings.jobs_site(name)?.clone();
        Ok(Self {
            main: SessionClient::new(site.portal.clone(), settings)?,
            desk: SessionClient::new(site.desk.clone(), settings)?,
            cv_dir: settings.cv_dir.clone(),
            cv_log: DownloadLog::new(settings.cv_log.clone()),
            site,
        })
    }

    pub fn company(&self) -> &str {
        &self.site.company
    }

    /// Logs into both the recruiter site and the applicant desk.
    #[instrument(skip(self), fields(company = %self.site.company))]
    pub async fn login(&self) -> Result<()> {
        for session in [&self.main, &self.desk] {
            if let LoginOutcome::MfaRequired(url) = session.login().await? {
                return Err(ScrapeError::Auth(format!("unexpected second factor at {url}")));
            }
        }
        Ok(())
    }

    async fn page(&self, session: &SessionClient, url: &str) -> Result<String> {
        let resp = session.check(session.get(url).await?)?;
        Ok(resp.text())
    }

    async fn main_page(&self, url: &str) -> Result<String> {
        self.main.protected(|| self.page(&self.main, url)).await
    }

    async fn desk_page(&self, url: &str) -> Result<String> {
        self.desk.protected(|| self.page(&self.desk, url)).await
    }

    fn listing_url(&self, company: Option<&str>) -> String {
        match company {
            Some(c) => self.main.url(&format!("/{}/offres-emploi", c.to_lowercase())),
            None => self.main.url("/offres-emploi/"),
        }
    }

    pub async fn job_details(&self, url: &str) -> Result<JobDetails> {
        let html = self.main_page(url).await?;
        parse_job_details(&html, url)
    }

    /// Every offer on the listing with its details; unreadable offers are skipped.
    #[instrument(skip(self))]
    pub async fn jobs(&self, company: Option<&str>) -> Result<JobsListing> {
        let html = self.main_page(&self.listing_url(company)).await?;
        let links = parse_job_links(&html, &self.site.portal.base_url)?;
        let mut jobs = Vec::with_capacity(links.len());
        for link in links {
            match self.job_details(&link.url).await {
                Ok(details) => jobs.push(details),
                Err(e) => tracing::warn!(url = %link.url, error = %e, "Skipping job offer"),
            }
        }
        tracing::info!(jobs = jobs.len(), "Fetched job offers");
        Ok(JobsListing {
            total: jobs.len(),
            jobs,
        })
    }

    #[instrument(skip(self))]
    pub async fn duplicatable_jobs(&self, company: &str) -> Result<Vec<JobLink>> {
        let html = self.main_page(&self.listing_url(Some(company))).await?;
        let links = parse_job_links(&html, &self.site.portal.base_url)?;
        tracing::info!(offers = links.len(), "Checking offers for duplication");
        let mut out = Vec::new();
        for link in links {
            match self.job_details(&link.url).await {
                Ok(d) if d.can_duplicate => out.push(link),
                Ok(_) => {}
                Err(e) => tracing::warn!(id = %link.id, error = %e, "Could not inspect offer"),
            }
        }
        tracing::info!(duplicatable = out.len(), "Duplicatable offers found");
        Ok(out)
    }

    async fn post_duplicate(&self, job_id: &str, referer: &str) -> Result<bool> {
        let mut extra = HeaderMap::new();
        extra.insert("X-Requested-With", HeaderValue::from_static("XMLHttpRequest"));
        extra.insert(
            REFERER,
            HeaderValue::from_str(referer)
                .map_err(|e| ScrapeError::Config(format!("bad referer {referer}: {e}")))?,
        );
        let form = vec![("id".to_string(), job_id.to_string())];
        let resp = self
            .main
            .post_form_with(&self.main.url(DUPLICATE_PATH), &form, extra)
            .await?;
        tracing::info!(job_id, status = resp.status, "Duplication answered");
        Ok(resp.status == 200)
    }

    #[instrument(skip(self))]
    pub async fn duplicate_job(&self, job_id: &str) -> Result<bool> {
        let referer = self.main.url(&format!("/offre-emploi/-{job_id}"));
        self.main
            .protected(|| self.post_duplicate(job_id, &referer))
            .await
    }

    #[instrument(skip(self))]
    pub async fn duplicate_random_job(&self, company: &str) -> Result<DuplicationOutcome> {
        let candidates = self.duplicatable_jobs(company).await?;
        let Some(job) = candidates.choose(&mut rand::rng()).cloned() else {
            tracing::warn!(company, "No duplicatable offers");
            return Ok(DuplicationOutcome {
                success: false,
                message: format!("No duplicatable jobs found for {company}"),
                job: None,
            });
        };
        tracing::info!(id = %job.id, title = %job.title, "Selected offer for duplication");
        let ok = self
            .main
            .protected(|| self.post_duplicate(&job.id, &job.url))
            .await?;
        Ok(DuplicationOutcome {
            success: ok,
            message: if ok {
                "Job duplicated successfully".into()
            } else {
                "Duplication was refused".into()
            },
            job: Some(job),
        })
    }

    /// Walks every listing page of the desk and scrapes each applicant.
    #[instrument(skip(self), fields(company = %self.site.company))]
    pub async fn candidatures(&self) -> Result<Vec<Candidate>> {
        let listing_url = self.desk.url(CANDIDATURES_PATH);
        let first = self.desk_page(&listing_url).await?;
        let pagination = parse_pagination(&first)?;
        let last_page = pagination.last_page.unwrap_or(1).max(1);
        tracing::info!(last_page, total = ?pagination.total_entries, "Candidature listing");

        let mut ids: Vec<String> = Vec::new();
        let mut seen = HashSet::new();
        for page in 1..=last_page {
            let html = match self.desk_page(&format!("{listing_url}page={page}")).await {
                Ok(h) => h,
                Err(e) if e.is_auth() => return Err(e),
                Err(e) => {
                    tracing::warn!(page, error = %e, "Skipping listing page");
                    continue;
                }
            };
            for id in parse_candidature_ids(&html)? {
                if seen.insert(id.clone()) {
                    ids.push(id);
                }
            }
        }

        let desk_base = &self.site.desk.base_url;
        let mut out = Vec::with_capacity(ids.len());
        for id in &ids {
            let html = match self.desk_page(&join_url(desk_base, id)).await {
                Ok(h) => h,
                Err(e) => {
                    tracing::warn!(candidature = %id, error = %e, "Skipping candidature");
                    continue;
                }
            };
            match parse_candidate(&html, id, desk_base)? {
                Some(c) => out.push(c),
                None => tracing::debug!(candidature = %id, "Empty candidature page"),
            }
        }
        tracing::info!(candidates = out.len(), "Scraped candidatures");
        Ok(out)
    }

    /// Fetches a CV unless its URL is already in the download log.
    #[instrument(skip(self))]
    pub async fn download_cv(&self, url: &str) -> Result<CvDownload> {
        if self.cv_log.contains(url)? {
            tracing::debug!(url, "CV already downloaded");
            return Ok(CvDownload {
                url: url.to_string(),
                path: None,
                skipped: true,
            });
        }
        let resp = self.desk.check(self.desk.get(url).await?)?;
        let name = cv_file_name(resp.header("content-disposition"), url);
        std::fs::create_dir_all(&self.cv_dir)?;
        let path = self.cv_dir.join(name);
        std::fs::write(&path, &resp.body)?;
        self.cv_log.record(url)?;
        tracing::info!(url, path = %path.display(), bytes = resp.body.len(), "Downloaded CV");
        Ok(CvDownload {
            url: url.to_string(),
            path: Some(path),
            skipped: false,
        })
    }

    /// Downloads the CVs of the given candidates; individual failures are logged.
    pub async fn download_cvs(&self, candidates: &[Candidate]) -> Vec<CvDownload> {
        let mut out = Vec::new();
        for c in candidates.iter().filter(|c| c.cv != NOT_AVAILABLE) {
            match self.download_cv(&c.cv).await {
                Ok(d) => out.push(d),
                Err(e) => tracing::warn!(url = %c.cv, error = %e, "CV download failed"),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"<html><body>
      <div class="offres"><h2><a href="/offre-emploi/teleconseiller-h-f-1204">Téléconseiller H/F</a></h2></div>
      <div class="offres"><h2>no link</h2></div>
      <div class="offres"><h2><a href="/offre-emploi/superviseur-77">Superviseur</a></h2></div>
    </body></html>"#;

    const OFFER: &str = r#"<html><body>
      <h1> Téléconseiller H/F </h1>
      <h2><a href="/xpercia">XPERCIA</a></h2>
      <span>Publiée le 02-05-2024 - Rabat</span>
      <i class="badge">Nbr candidatures : 37</i>
      <h3>Description</h3><div><p>Appels sortants.</p></div>
      <h3>Profil</h3><p>Bac minimum.</p>
      <span>Langue(s) : <a>#Français</a> <a>#Anglais </a></span>
      <a class="duplioffre" href="javascript:void(0)" data-id="1204">Dupliquer</a>
    </body></html>"#;

    const CANDIDATE: &str = r##"<html><body>
      <section class="content-header"><h1>Candidature <small>Téléconseiller H/F</small></h1></section>
      <h3 class="box-title">Informations</h3>
      <h3 class="box-title">Candidature reçue le 02/05/2024 14:32</h3>
      <input name="NOM" value="Alaoui"><input name="PRENOM" value="Sara">
      <input name="EMAIL" value="sara@example.ma"><input name="TEL" value="0600000000">
      <a id="cvlink" href="/cv/download/991">CV</a>
      <script>
        $('#VILLE').val('Rabat');
        $( "#EXPERIENCE" ) . val( "2 ans" );
      </script>
    </body></html>"##;

    #[test]
    fn listing_links_are_absolute_with_ids() {
        let links = parse_job_links(LISTING, "https://www.moncallcenter.ma").unwrap();
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].id, "1204");
        assert_eq!(
            links[0].url,
            "https://www.moncallcenter.ma/offre-emploi/teleconseiller-h-f-1204"
        );
        assert_eq!(links[1].title, "Superviseur");
    }

    #[test]
    fn offer_page_fields() {
        let d = parse_job_details(OFFER, "u").unwrap();
        assert_eq!(d.title, "Téléconseiller H/F");
        assert_eq!(d.company, "XPERCIA");
        assert_eq!(d.date, "2024-05-02");
        assert_eq!(d.location, "Rabat");
        assert_eq!(d.stats.applications, 37);
        assert_eq!(d.sections["Description"], "Appels sortants.");
        assert_eq!(d.sections["Profil"], "Bac minimum.");
        assert_eq!(d.languages, ["Français", "Anglais"]);
        assert!(d.can_duplicate);
    }

    #[test]
    fn sparse_offer_page_falls_back() {
        let d = parse_job_details("<html><body><p>rien</p></body></html>", "u").unwrap();
        assert_eq!(d.title, NOT_AVAILABLE);
        assert_eq!(d.date, NOT_AVAILABLE);
        assert_eq!(d.stats.applications, 0);
        assert!(d.sections.is_empty());
        assert!(!d.can_duplicate);
    }

    #[test]
    fn pagination_and_ids() {
        let html = r#"<h3>124 candidatures</h3>
          <a href="/candidatures/?page=2">2</a><a href="/candidatures/?page=5">5</a>
          <a href="/candidature/id-10">x</a><a href="/candidature/id-11">y</a><a href="/candidature/id-10">z</a>"#;
        let p = parse_pagination(html).unwrap();
        assert_eq!(p.last_page, Some(5));
        assert_eq!(p.total_entries, Some(124));
        assert_eq!(
            parse_candidature_ids(html).unwrap(),
            ["/candidature/id-10", "/candidature/id-11"]
        );
        assert_eq!(parse_pagination("<p></p>").unwrap().last_page, None);
    }

    #[test]
    fn candidate_page_fields() {
        let c = parse_candidate(CANDIDATE, "/candidature/id-10", "https://mcdesk.moncallcenter.ma")
            .unwrap()
            .unwrap();
        assert_eq!(c.name, "Alaoui Sara");
        assert_eq!(c.email, "sara@example.ma");
        assert_eq!(c.city, "Rabat");
        assert_eq!(c.experience, "2 ans");
        assert_eq!(c.gender, NOT_AVAILABLE);
        assert_eq!(c.titre_annonce, "Téléconseiller H/F");
        assert_eq!(c.cv, "https://mcdesk.moncallcenter.ma/cv/download/991");
        assert_eq!((c.date.as_str(), c.time.as_str()), ("02/05/2024", "14:32"));

        assert!(parse_candidate("<html></html>", "x", "https://d").unwrap().is_none());
    }

    #[test]
    fn cv_names_come_from_disposition_or_url() {
        assert_eq!(
            cv_file_name(Some(r#"attachment; filename="CV Sara.pdf""#), "https://d/cv/1"),
            "CV Sara.pdf"
        );
        assert_eq!(cv_file_name(None, "https://d/cv/991.pdf?x=1"), "991.pdf");
        assert_eq!(cv_file_name(Some("attachment; filename=../../etc/passwd"), "u"), "passwd");
    }

    #[test]
    fn download_log_is_append_only() {
        let dir = tempfile::tempdir().unwrap();
        let log = DownloadLog::new(dir.path().join("downloaded_cvs.txt"));
        assert!(!log.contains("https://d/cv/1").unwrap());
        log.record("https://d/cv/1").unwrap();
        log.record("https://d/cv/2").unwrap();
        assert!(log.contains("https://d/cv/1").unwrap());
        assert_eq!(log.entries().unwrap().len(), 2);
    }

    #[test]
    fn candidate_record_follows_sheet_columns() {
        let na = || NOT_AVAILABLE.to_string();
        let c = Candidate {
            candidature_id: "77".into(),
            name: "Sara Alami".into(),
            email: na(),
            phone: na(),
            city: na(),
            experience: na(),
            gender: na(),
            titre_annonce: na(),
            cv: na(),
            date: na(),
            time: na(),
        };
        let keys: Vec<String> = c.to_record().keys().cloned().collect();
        assert_eq!(keys, CANDIDATE_COLUMNS);
        assert!(!c.is_blank());
    }
}
