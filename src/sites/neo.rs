//! Insurance extranet: CSRF login with an emailed second factor, then contract search.

use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue};
use scraper::{ElementRef, Html};
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, LazyLock};
use tracing::instrument;

use super::{element_text, selector, DateRange, NOT_AVAILABLE};
use crate::config::{AppSettings, NeoSite};
use crate::error::{Result, ScrapeError};
use crate::mfa::{run_challenge, MfaChallenge, MfaCodeSource, MfaState, PortalMfa};
use crate::session::{LoginOutcome, SessionClient};

static TOTAL_PATTERNS: LazyLock<Vec<(Regex, bool)>> = LazyLock::new(|| {
    [
        (r"(?i)(\d+)\s*résultats", false),
        (r"(?i)(\d+)\s*results", false),
        (r"(?i)Page\s*\d+\s*/\s*(\d+)", true),
    ]
    .into_iter()
    .map(|(p, is_pages)| (Regex::new(p).expect("static pattern"), is_pages))
    .collect()
});

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Contract {
    pub id: String,
    pub formula: String,
    pub status: String,
    pub price: String,
    pub effect_date: String,
    pub subscriber: String,
    pub phone: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContractPagination {
    pub current_page: u32,
    pub limit: u32,
    pub total: u64,
    pub total_pages: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContractPage {
    pub data: Vec<Contract>,
    pub pagination: ContractPagination,
}

#[derive(Debug, Clone, Default)]
pub struct ContractQuery {
    pub range: Option<DateRange>,
    pub page: u32,
    pub limit: u32,
}

fn cell(row: ElementRef<'_>, class: &str) -> Result<Option<String>> {
    let sel = selector(&format!("td.{class}"))?;
    Ok(row.select(&sel).next().map(element_text))
}

fn parse_row(row: ElementRef<'_>) -> Result<Option<Contract>> {
    let Some(id) = row.value().attr("data-contract-id") else {
        return Ok(None);
    };
    let or_na = |v: Option<String>| v.unwrap_or_else(|| NOT_AVAILABLE.to_string());
    let status_sel = selector("td.x-column--product-status span.x-text--first-letter")?;
    let status = row.select(&status_sel).next().map(element_text);
    Ok(Some(Contract {
        id: id.to_string(),
        formula: or_na(cell(row, "x-column--product-name")?),
        status: or_na(status),
        price: or_na(cell(row, "x-column--product-price")?),
        effect_date: or_na(cell(row, "x-column--effect-date")?),
        subscriber: or_na(cell(row, "x-column--subscriber")?),
        phone: or_na(cell(row, "x-column--contact")?),
    }))
}

/// Total results from the page text. A `Page x / y` counter gives the page count
/// instead; when nothing matches, the rows on this page are the total.
pub fn pagination_info(text: &str, count: usize, page: u32, limit: u32) -> ContractPagination {
    let limit = limit.max(1);
    let found = TOTAL_PATTERNS.iter().find_map(|(re, is_pages)| {
        let n: u64 = re.captures(text)?[1].parse().ok()?;
        Some((n, *is_pages))
    });
    let (total, total_pages) = match found {
        Some((n, false)) => (n, n.div_ceil(u64::from(limit))),
        Some((pages, true)) => (count as u64, pages),
        None => {
            tracing::warn!("No result count on the search page");
            (count as u64, (count as u64).div_ceil(u64::from(limit)))
        }
    };
    ContractPagination {
        current_page: page,
        limit,
        total,
        total_pages,
    }
}

/// Rows of the `#jsResultSearch` table plus pagination.
pub fn parse_contracts(html: &str, page: u32, limit: u32) -> Result<ContractPage> {
    let doc = Html::parse_document(html);
    let table = doc
        .select(&selector("table#jsResultSearch")?)
        .next()
        .ok_or_else(|| ScrapeError::Markup("contracts table not found".into()))?;

    let mut data = Vec::new();
    for row in table.select(&selector("tr[data-contract-id]")?) {
        if let Some(contract) = parse_row(row)? {
            data.push(contract);
        }
    }
    let text = element_text(doc.root_element());
    let pagination = pagination_info(&text, data.len(), page, limit);
    Ok(ContractPage { data, pagination })
}

pub fn search_params(
    site: &NeoSite,
    query: &ContractQuery,
    csrf: &str,
) -> Vec<(String, String)> {
    let mut params = vec![
        ("page".to_string(), query.page.max(1).to_string()),
        ("limit".to_string(), query.limit.max(1).to_string()),
        (site.mfa.csrf_field.clone(), csrf.to_string()),
    ];
    if let Some(range) = &query.range {
        let start = range.start.format(&site.date_format).to_string();
        let end = range.end.format(&site.date_format).to_string();
        for field in ["dateinsert", "datesign", "dateeffect"] {
            params.push((format!("{field}start"), start.clone()));
            params.push((format!("{field}end"), end.clone()));
        }
    }
    params
}

pub struct NeoClient {
    site: NeoSite,
    session: SessionClient,
    codes: Arc<dyn MfaCodeSource>,
}

impl NeoClient {
    pub fn new(settings: &AppSettings, codes: Arc<dyn MfaCodeSource>) -> Result<Self> {
        let site = settings.neo_site()?.clone();
        let session = SessionClient::new(site.portal.clone(), settings)?;
        Ok(Self {
            site,
            session,
            codes,
        })
    }

    /// Login, continuing through the emailed code when the portal asks for it.
    #[instrument(skip(self))]
    pub async fn login(&self) -> Result<()> {
        let url = match self.session.login().await? {
            LoginOutcome::Authenticated => return Ok(()),
            LoginOutcome::MfaRequired(url) => url,
        };

        let challenge = MfaChallenge::from_url(url)?;
        let transport = PortalMfa {
            session: &self.session,
            flow: &self.site.mfa,
        };
        let state = run_challenge(
            &transport,
            &challenge,
            self.codes.as_ref(),
            self.site.mfa_wait(),
        )
        .await;
        if state != MfaState::Verified {
            return Err(ScrapeError::MfaFailed(format!("challenge ended in {state:?}")));
        }
        if !self.session.is_authenticated().await? {
            tracing::error!("Dashboard refused after second factor");
            return Err(ScrapeError::MfaFailed("dashboard refused after verification".into()));
        }
        self.session.mark_authenticated();
        tracing::info!("Logged in with second factor");
        Ok(())
    }

    /// Probes the session first, logs in when it is gone, and retries once after a
    /// mid-operation expiry.
    async fn with_session<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.session.is_authenticated().await? {
            tracing::info!("Session missing, logging in");
            self.login().await?;
        }
        match op().await {
            Err(e) if e.is_auth() => {
                tracing::warn!(error = %e, "Session expired during request, logging in again");
                self.login().await?;
                op().await
            }
            other => other,
        }
    }

    async fn search_page(&self, query: &ContractQuery) -> Result<ContractPage> {
        let params = search_params(&self.site, query, &self.session.csrf_token());
        let mut extra = HeaderMap::new();
        if let Ok(referer) = HeaderValue::from_str(&self.session.url("/dashboard")) {
            extra.insert(reqwest::header::REFERER, referer);
        }
        let resp = self
            .session
            .send(
                reqwest::Method::GET,
                &self.session.url(&self.site.search_path),
                &params,
                None,
                extra,
            )
            .await?;
        let resp = self.session.check(resp)?;
        parse_contracts(&resp.text(), query.page.max(1), query.limit.max(1)).inspect_err(|e| {
            tracing::error!(error = %e, "Search page unreadable");
            self.session.dump_debug("neo_search", &resp.body);
        })
    }

    #[instrument(skip(self))]
    pub async fn contracts(&self, query: ContractQuery) -> Result<ContractPage> {
        let query = ContractQuery {
            limit: if query.limit == 0 { self.site.page_limit } else { query.limit },
            page: query.page.max(1),
            range: query.range,
        };
        let page = self.with_session(|| self.search_page(&query)).await?;
        tracing::info!(
            rows = page.data.len(),
            total = page.pagination.total,
            "Fetched contracts"
        );
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEARCH_HTML: &str = r#"<html><body>
      <div class="page-content"><p>57 résultats</p>
      <table id="jsResultSearch">
        <tr><th>Produit</th></tr>
        <tr data-contract-id="C-1">
          <td class="x-column--product-name"> Santé Pro </td>
          <td class="x-column--product-status"><span class="x-text--first-letter">en cours</span></td>
          <td class="x-column--product-price">42,10 €</td>
          <td class="x-column--effect-date">01/06/2024</td>
          <td class="x-column--subscriber">DURAND Paul</td>
          <td class="x-column--contact">0600000000</td>
        </tr>
        <tr data-contract-id="C-2">
          <td class="x-column--product-name">Obsèques</td>
          <td class="x-column--product-status">validé</td>
        </tr>
      </table></div>
    </body></html>"#;

    #[test]
    fn rows_become_contracts_with_placeholders() {
        let page = parse_contracts(SEARCH_HTML, 1, 20).unwrap();
        assert_eq!(page.data.len(), 2);
        let first = &page.data[0];
        assert_eq!(first.id, "C-1");
        assert_eq!(first.formula, "Santé Pro");
        assert_eq!(first.status, "en cours");
        assert_eq!(first.price, "42,10 €");
        let second = &page.data[1];
        assert_eq!(second.status, NOT_AVAILABLE);
        assert_eq!(second.phone, NOT_AVAILABLE);
        assert_eq!(page.pagination.total, 57);
        assert_eq!(page.pagination.total_pages, 3);
    }

    #[test]
    fn missing_table_is_a_markup_error() {
        assert!(matches!(
            parse_contracts("<html><p>Connexion</p></html>", 1, 20),
            Err(ScrapeError::Markup(_))
        ));
    }

    #[test]
    fn pagination_patterns_in_order() {
        assert_eq!(pagination_info("12 results", 5, 1, 5).total_pages, 3);
        let paged = pagination_info("Page 1 / 4", 20, 1, 20);
        assert_eq!((paged.total, paged.total_pages), (20, 4));
        let none = pagination_info("nothing here", 7, 2, 20);
        assert_eq!((none.total, none.total_pages, none.current_page), (7, 1, 2));
    }

    #[test]
    fn search_params_carry_csrf_and_dates() {
        let settings = AppSettings::load(None).unwrap();
        let site = settings.neo_site().unwrap();
        let query = ContractQuery {
            range: Some(DateRange::parse("2024-05-01", "2024-05-31").unwrap()),
            page: 2,
            limit: 50,
        };
        let params = search_params(site, &query, "tok");
        let get = |k: &str| params.iter().find(|(n, _)| n == k).map(|(_, v)| v.as_str());
        assert_eq!(get("page"), Some("2"));
        assert_eq!(get("csrf_extranet_token_name"), Some("tok"));
        assert_eq!(get("dateinsertstart"), Some("01/05/2024"));
        assert_eq!(get("dateeffectend"), Some("31/05/2024"));
        assert_eq!(params.len(), 9);
    }
}
