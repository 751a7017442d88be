//! Call-center CRM: campaign lists, qualification trees, searches and CSV exports.

use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::instrument;

use super::{DateRange, DateRangeText};
use crate::config::{AppSettings, CrmSite, QualifCategories};
use crate::error::{Result, ScrapeError};
use crate::listing::{parse_option_groups, OptionGroups};
use crate::session::{LoginOutcome, SessionClient};
use crate::tabular::{normalize, ExportKind, Page, Table};
use crate::window::{default_cursor_start, FetchCursor, IncrementalFetch, IncrementalReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualifKind {
    Sales,
    Callback,
    Rejection,
    Other,
}

impl QualifKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().trim_end_matches("_qualifs") {
            "sales" => Some(Self::Sales),
            "callback" => Some(Self::Callback),
            "rejection" => Some(Self::Rejection),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

pub fn classify(categories: &QualifCategories, name: &str) -> QualifKind {
    if categories.sales.iter().any(|n| n == name) {
        QualifKind::Sales
    } else if categories.callback.iter().any(|n| n == name) {
        QualifKind::Callback
    } else if categories.rejection.iter().any(|n| n == name)
        || categories
            .rejection_prefixes
            .iter()
            .any(|p| name.starts_with(p.as_str()))
    {
        QualifKind::Rejection
    } else {
        QualifKind::Other
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Qualif {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub argumente: String,
    pub type_qualif: String,
    pub man_auto: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CampaignQualifs {
    pub campaign_id: String,
    pub campaign_name: String,
    pub sales_qualifs: Vec<Qualif>,
    pub callback_qualifs: Vec<Qualif>,
    pub rejection_qualifs: Vec<Qualif>,
    pub other_qualifs: Vec<Qualif>,
}

impl CampaignQualifs {
    pub fn of_kind(&self, kind: QualifKind) -> &[Qualif] {
        match kind {
            QualifKind::Sales => &self.sales_qualifs,
            QualifKind::Callback => &self.callback_qualifs,
            QualifKind::Rejection => &self.rejection_qualifs,
            QualifKind::Other => &self.other_qualifs,
        }
    }
}

#[derive(Deserialize)]
struct TreeNode {
    #[serde(default)]
    text: String,
    #[serde(default)]
    li_attr: HashMap<String, Value>,
    #[serde(default)]
    children: Vec<TreeNode>,
}

fn attr_text(attrs: &HashMap<String, Value>, key: &str) -> String {
    match attrs.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// Sorts the qualification tree returned by the CRM into the configured categories.
pub fn parse_qualifications(body: &[u8], categories: &QualifCategories) -> Result<Vec<CampaignQualifs>> {
    let tree: Vec<TreeNode> = serde_json::from_slice(body)?;
    let mut out = Vec::with_capacity(tree.len());
    for campaign in tree {
        let campaign_id = attr_text(&campaign.li_attr, "num_campagne");
        if campaign_id.is_empty() {
            tracing::warn!(name = %campaign.text, "Campaign node without id, skipping");
            continue;
        }
        let mut entry = CampaignQualifs {
            campaign_id,
            campaign_name: campaign.text,
            sales_qualifs: Vec::new(),
            callback_qualifs: Vec::new(),
            rejection_qualifs: Vec::new(),
            other_qualifs: Vec::new(),
        };
        for node in campaign.children {
            let qualif = Qualif {
                id: attr_text(&node.li_attr, "num_qualif"),
                kind: attr_text(&node.li_attr, "type"),
                argumente: attr_text(&node.li_attr, "argumente"),
                type_qualif: attr_text(&node.li_attr, "type_qualif"),
                man_auto: attr_text(&node.li_attr, "man_auto"),
                name: node.text,
            };
            let bucket = match classify(categories, &qualif.name) {
                QualifKind::Sales => &mut entry.sales_qualifs,
                QualifKind::Callback => &mut entry.callback_qualifs,
                QualifKind::Rejection => &mut entry.rejection_qualifs,
                QualifKind::Other => &mut entry.other_qualifs,
            };
            bucket.push(qualif);
        }
        out.push(entry);
    }
    Ok(out)
}

fn treatment_label(range: &DateRange) -> String {
    format!(
        "Du {} Au {}",
        range.start.format("%d %B %Y"),
        range.end.format("%d %B %Y")
    )
}

fn pairs(items: &[(&str, String)]) -> Vec<(String, String)> {
    items.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

/// Form body of the CSV export for the given campaigns.
pub fn export_payload(
    site: &CrmSite,
    campaign_ids: &[String],
    range: &DateRange,
    token: &str,
) -> Vec<(String, String)> {
    let mut form = pairs(&[
        ("CMK_FORM_ACTION", "csv".into()),
        ("CMK_DWNLOAD_TOKEN", token.to_string()),
        ("CMK_FORM_MODEL", site.export_model.clone()),
        ("CMK_FORM_CONTACTS", "-1".into()),
        ("selectGroup", "on".into()),
        ("dateprod[start]", range.start_str()),
        ("dateprod[end]", range.end_str()),
        ("dateType", "1".into()),
        ("dateTraitement", treatment_label(range)),
        ("datetrait[start]", range.start_str()),
        ("datetrait[end]", range.end_str()),
        ("selectChamps[]", String::new()),
        ("selectInputs[]", "-1".into()),
    ]);
    for id in campaign_ids {
        form.push(("selectGroups[]".into(), id.clone()));
        form.push(("selectItem".into(), id.clone()));
    }
    for q in &site.qualif_filter {
        form.push(("selectQualifs[7][]".into(), q.clone()));
    }
    form
}

/// Form body of the on-screen search.
pub fn search_payload(
    site: &CrmSite,
    campaign_ids: &[String],
    qualif_ids: &[String],
    range: &DateRange,
) -> Vec<(String, String)> {
    let mut form = pairs(&[
        ("CMK_FORM_ACTION", "display".into()),
        ("CMK_DWNLOAD_TOKEN", String::new()),
        ("CMK_FORM_MODEL", site.export_model.clone()),
        ("CMK_FORM_CONTACTS", "-1".into()),
        ("selectGroup", "on".into()),
        ("dateprod[start]", range.start_str()),
        ("dateprod[end]", range.end_str()),
        ("dateType", "1".into()),
        ("qualifType", "1".into()),
        ("dateTraitement", treatment_label(range)),
        ("datetrait[start]", range.start_str()),
        ("datetrait[end]", range.end_str()),
        ("selectChamps[]", String::new()),
        ("selectInputs[]", "-1".into()),
    ]);
    for id in campaign_ids {
        form.push(("selectGroups[]".into(), id.clone()));
        form.push(("selectItem".into(), id.clone()));
    }
    for q in qualif_ids {
        form.push(("selectQualifs[7][]".into(), q.clone()));
    }
    for i in 10..=30 {
        form.push(("selectQualifs[-1][]".into(), format!("-{i}")));
    }
    form
}

/// True when an export body holds at most a header line.
fn is_header_only(body: &[u8]) -> bool {
    body.split(|b| *b == b'\n')
        .filter(|line| line.iter().any(|b| !b.is_ascii_whitespace()))
        .count()
        <= 1
}

#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub range: Option<DateRange>,
    pub campaign_ids: Vec<String>,
    pub qualif_kinds: Vec<QualifKind>,
    pub qualif_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub data: Vec<Value>,
    pub total: u64,
    pub date_range: DateRangeText,
}

pub fn parse_search_response(body: &[u8], range: &DateRange) -> Result<SearchResult> {
    let value: Value = serde_json::from_slice(body)?;
    let data = value
        .get("data")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let total = match value.get("countresult") {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    };
    Ok(SearchResult {
        data,
        total,
        date_range: range.text(),
    })
}

pub struct CrmClient {
    name: String,
    site: CrmSite,
    session: SessionClient,
    cursor_path: PathBuf,
}

impl CrmClient {
    pub fn new(name: &str, settings: &AppSettings) -> Result<Self> {
        let site = settings.crm_site(name)?.clone();
        let session = SessionClient::new(site.portal.clone(), settings)?;
        let cursor_path = match settings.crm.len() {
            1 => settings.cursor_path.clone(),
            _ => suffixed(&settings.cursor_path, name),
        };
        Ok(Self {
            name: name.to_string(),
            site,
            session,
            cursor_path,
        })
    }

    #[instrument(skip(self), fields(crm = %self.name))]
    pub async fn login(&self) -> Result<()> {
        match self.session.login().await? {
            LoginOutcome::Authenticated => Ok(()),
            LoginOutcome::MfaRequired(url) => Err(ScrapeError::Auth(format!(
                "unexpected second factor at {url}"
            ))),
        }
    }

    async fn post_checked(&self, path: &str, form: &[(String, String)]) -> Result<Vec<u8>> {
        let resp = self.session.post_form(&self.session.url(path), form).await?;
        let resp = self.session.check(resp)?;
        Ok(resp.body)
    }

    /// Campaigns with production in `range`, grouped as in the date filter.
    #[instrument(skip(self), fields(crm = %self.name))]
    pub async fn campaigns(&self, range: &DateRange) -> Result<OptionGroups> {
        let form = pairs(&[("start", range.start_str()), ("end", range.end_str())]);
        let body = self
            .session
            .protected(|| self.post_checked(&self.site.filter_path, &form))
            .await?;
        let groups = parse_option_groups(&String::from_utf8_lossy(&body));
        if groups.is_empty() {
            self.session.dump_debug("crm_campaigns", &body);
        }
        tracing::info!(
            groups = groups.groups().len(),
            campaigns = groups.option_count(),
            "Fetched campaigns"
        );
        Ok(groups)
    }

    async fn group_campaign_ids(&self, range: &DateRange) -> Result<Vec<String>> {
        let ids = self.campaigns(range).await?.ids(&self.site.campaign_group);
        if ids.is_empty() {
            tracing::warn!(group = %self.site.campaign_group, "No campaigns in the configured group");
        }
        Ok(ids)
    }

    #[instrument(skip(self), fields(crm = %self.name))]
    pub async fn qualifications(&self, campaign_ids: &[String]) -> Result<Vec<CampaignQualifs>> {
        let form: Vec<(String, String)> = campaign_ids
            .iter()
            .map(|id| ("campagnes[]".to_string(), id.clone()))
            .collect();
        let body = self
            .session
            .protected(|| self.post_checked(&self.site.qualifs_path, &form))
            .await?;
        let parsed = parse_qualifications(&body, &self.site.categories).inspect_err(|e| {
            tracing::error!(error = %e, "Qualification tree unreadable");
        })?;
        tracing::info!(campaigns = parsed.len(), "Fetched qualifications");
        Ok(parsed)
    }

    /// On-screen search. Missing campaigns default to the configured group; qualification
    /// kinds are resolved against the first campaign's tree.
    #[instrument(skip(self), fields(crm = %self.name))]
    pub async fn search(&self, query: SearchQuery) -> Result<SearchResult> {
        let range = query.range.unwrap_or_else(DateRange::today);
        let campaign_ids = if query.campaign_ids.is_empty() {
            self.group_campaign_ids(&range).await?
        } else {
            query.campaign_ids
        };

        let mut qualif_ids = query.qualif_ids;
        if qualif_ids.is_empty() && !query.qualif_kinds.is_empty() {
            if let Some(first) = campaign_ids.first() {
                let tree = self.qualifications(std::slice::from_ref(first)).await?;
                if let Some(campaign) = tree.first() {
                    for kind in &query.qualif_kinds {
                        qualif_ids.extend(campaign.of_kind(*kind).iter().map(|q| q.id.clone()));
                    }
                }
            }
            tracing::debug!(qualifs = qualif_ids.len(), "Resolved qualification kinds");
        }

        let form = search_payload(&self.site, &campaign_ids, &qualif_ids, &range);
        let body = self
            .session
            .protected(|| self.post_checked(&self.site.search_path, &form))
            .await?;
        let result = parse_search_response(&body, &range).inspect_err(|e| {
            tracing::error!(error = %e, "Search response is not JSON");
            self.session.dump_debug("crm_search", &body);
        })?;
        tracing::info!(rows = result.data.len(), total = result.total, "Search completed");
        Ok(result)
    }

    /// CSV export of the configured campaign group.
    #[instrument(skip(self), fields(crm = %self.name))]
    pub async fn export(&self, range: &DateRange) -> Result<Table> {
        let campaign_ids = self.group_campaign_ids(range).await?;
        if campaign_ids.is_empty() {
            return Ok(Table::default());
        }
        let token = format!("cmk_export_{}", Local::now().format("%Y%m%d%H%M%S"));
        let form = export_payload(&self.site, &campaign_ids, range, &token);
        let body = self
            .session
            .protected(|| self.post_checked(&self.site.search_path, &form))
            .await?;
        if is_header_only(&body) {
            tracing::info!(bytes = body.len(), "Export has no data rows");
            return Ok(Table::default());
        }
        let kind = ExportKind::Csv {
            delimiter: self.site.delimiter_byte(),
        };
        normalize(&body, kind).inspect_err(|_| {
            self.session.dump_debug("crm_export", &body);
        })
    }

    pub async fn export_page(&self, range: &DateRange, page: usize, page_size: usize) -> Result<Page> {
        if page == 0 || page_size == 0 {
            return Err(ScrapeError::InvalidPage { page, page_size });
        }
        self.export(range).await?.page(page, page_size)
    }

    /// Catches up from the stored cursor in fifteen-minute windows.
    #[instrument(skip(self), fields(crm = %self.name))]
    pub async fn incremental(&self, now: NaiveDateTime, full_refresh: bool) -> Result<IncrementalReport> {
        let cursor = FetchCursor::load(&self.cursor_path, default_cursor_start());
        let mut fetch = IncrementalFetch::new(cursor, self.site.unique_key.clone());
        fetch
            .run(now, full_refresh, |window| async move {
                self.export(&DateRange::from(window)).await.map(|t| t.records)
            })
            .await
    }
}

fn suffixed(path: &std::path::Path, name: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "last_fetch".into());
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    path.with_file_name(format!("{stem}_{name}{ext}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site() -> CrmSite {
        AppSettings::load(None).unwrap().crm_site("ringassur").unwrap().clone()
    }

    fn range() -> DateRange {
        DateRange::parse("2024-05-02 08:00:00", "2024-05-02 08:15:00").unwrap()
    }

    const QUALIF_TREE: &str = r#"[
      {"text": "Prevoyance Janvier", "li_attr": {"num_campagne": 7},
       "children": [
         {"text": "Vente", "li_attr": {"num_qualif": "76", "type": "7", "argumente": "1", "type_qualif": "1", "man_auto": "M"}},
         {"text": "NRP", "li_attr": {"num_qualif": "12", "type": "7", "argumente": "0", "type_qualif": "2", "man_auto": "A"}},
         {"text": "Refus prix", "li_attr": {"num_qualif": "30", "type": "7"}},
         {"text": "Bloctel", "li_attr": {"num_qualif": "31", "type": "7"}},
         {"text": "Doublon", "li_attr": {"num_qualif": "40", "type": "7"}}
       ]},
      {"text": "orphan", "li_attr": {}}
    ]"#;

    #[test]
    fn qualifications_are_sorted_into_categories() {
        let parsed = parse_qualifications(QUALIF_TREE.as_bytes(), &site().categories).unwrap();
        assert_eq!(parsed.len(), 1);
        let c = &parsed[0];
        assert_eq!(c.campaign_id, "7");
        assert_eq!(c.sales_qualifs[0].id, "76");
        assert_eq!(c.callback_qualifs[0].name, "NRP");
        let rejected: Vec<_> = c.rejection_qualifs.iter().map(|q| q.name.as_str()).collect();
        assert_eq!(rejected, ["Refus prix", "Bloctel"]);
        assert_eq!(c.other_qualifs[0].name, "Doublon");
        assert_eq!(c.other_qualifs[0].man_auto, "");
    }

    #[test]
    fn export_payload_uses_one_model_and_repeats_multi_values() {
        let form = export_payload(&site(), &["101".into(), "102".into()], &range(), "tok");
        let values = |key: &str| -> Vec<&str> {
            form.iter().filter(|(k, _)| k == key).map(|(_, v)| v.as_str()).collect()
        };
        assert_eq!(values("CMK_FORM_ACTION"), ["csv"]);
        assert_eq!(values("CMK_FORM_MODEL"), ["-1"]);
        assert_eq!(values("selectGroups[]"), ["101", "102"]);
        assert_eq!(values("selectItem"), ["101", "102"]);
        assert_eq!(values("selectQualifs[7][]"), ["76", "523"]);
        assert_eq!(values("dateprod[start]"), ["2024-05-02 08:00:00"]);
        assert_eq!(values("dateTraitement"), ["Du 02 May 2024 Au 02 May 2024"]);
    }

    #[test]
    fn search_payload_adds_system_qualifs() {
        let form = search_payload(&site(), &["101".into()], &["76".into()], &range());
        let system: Vec<_> = form
            .iter()
            .filter(|(k, _)| k == "selectQualifs[-1][]")
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(system.len(), 21);
        assert_eq!(system.first(), Some(&"-10"));
        assert_eq!(system.last(), Some(&"-30"));
        assert!(form.contains(&("CMK_FORM_ACTION".into(), "display".into())));
        assert_eq!(
            search_payload(&site(), &[], &[], &range())
                .iter()
                .find(|(k, _)| k == "CMK_FORM_MODEL")
                .map(|(_, v)| v.as_str()),
            export_payload(&site(), &[], &range(), "t")
                .iter()
                .find(|(k, _)| k == "CMK_FORM_MODEL")
                .map(|(_, v)| v.as_str())
        );
    }

    #[test]
    fn search_response_total_may_be_text() {
        let r = parse_search_response(br#"{"data": [{"a": 1}], "countresult": "42"}"#, &range()).unwrap();
        assert_eq!(r.total, 42);
        assert_eq!(r.data.len(), 1);
        let empty = parse_search_response(b"{}", &range()).unwrap();
        assert_eq!(empty.total, 0);
        assert!(parse_search_response(b"<html>", &range()).is_err());
    }

    #[test]
    fn header_only_exports_are_detected() {
        assert!(is_header_only(b"A;B\n"));
        assert!(is_header_only(b"\n\n"));
        assert!(!is_header_only(b"A;B\n1;2\n"));
    }

    #[test]
    fn qualif_kinds_parse_from_both_spellings() {
        assert_eq!(QualifKind::parse("sales"), Some(QualifKind::Sales));
        assert_eq!(QualifKind::parse("callback_qualifs"), Some(QualifKind::Callback));
        assert_eq!(QualifKind::parse("nope"), None);
    }

    #[test]
    fn cursor_files_are_per_account() {
        assert_eq!(
            suffixed(std::path::Path::new("state/last_fetch.json"), "ringassur"),
            PathBuf::from("state/last_fetch_ringassur.json")
        );
    }
}
