// tests/crm_markup.rs
use portal_scrape::listing::parse_option_groups;
use portal_scrape::sites::crm::export_payload;
use portal_scrape::sites::DateRange;
use portal_scrape::tabular::normalize_csv;
use portal_scrape::{AppSettings, ScrapeError};

const FILTER_FRAGMENT: &str = r#"
<select name="selectItem" multiple>
  <optgroup label="Prevoyance">
    <option value="311" data-numcampagne="12">Obsèques &amp; Prévoyance</option>
    <option value="318" data-numcampagne="12">Prévoyance Pro</option>
  </optgroup>
  <optgroup label="Sante">
    <option value="402" data-numcampagne="14">Mutuelle Senior</option>
  </optgroup>
</select>"#;

#[test]
fn campaign_group_drives_the_export_form() {
    let settings = AppSettings::load(None).unwrap();
    let site = settings.crm_site("ringassur").unwrap();

    let groups = parse_option_groups(FILTER_FRAGMENT);
    assert_eq!(groups.option_count(), 3);
    let ids = groups.ids(&site.campaign_group);
    assert_eq!(ids, ["311", "318"]);
    assert_eq!(groups.get("Prevoyance").unwrap()[0].name, "Obsèques & Prévoyance");

    let range = DateRange::parse("2024-05-02", "2024-05-02 23:59:59").unwrap();
    let form = export_payload(site, &ids, &range, "1714600000");
    let values = |key: &str| -> Vec<&str> {
        form.iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    };
    assert_eq!(values("selectGroups[]"), ["311", "318"]);
    assert_eq!(values("CMK_FORM_MODEL"), [site.export_model.as_str()]);
    assert_eq!(values("dateprod[start]"), ["2024-05-02 00:00:00"]);
    assert_eq!(values("selectQualifs[7][]"), ["76", "523"]);
}

#[test]
fn export_pages_after_normalizing() {
    let mut body = b"CMK_S_FIELD_ID_UNIQUE;NOM;TEL\n".to_vec();
    for i in 1..=23 {
        body.extend(format!("{i};Client {i};06000000{i:02}\n").bytes());
    }
    body.extend(b"24;trop;de;champs\n");

    let table = normalize_csv(&body, b';').unwrap();
    assert_eq!(table.len(), 23);

    let last = table.page(3, 10).unwrap();
    assert_eq!(last.records.len(), 3);
    assert_eq!((last.total_records, last.total_pages), (23, 3));
    assert!(table.page(4, 10).unwrap().records.is_empty());
    assert!(matches!(table.page(0, 10), Err(ScrapeError::InvalidPage { .. })));
}
