//! Grouped `<optgroup>/<option>` lists, as rendered by the CRM date filter.

use regex::Regex;
use scraper::{Html, Selector};
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::sync::LazyLock;

const PARENT_ATTR: &str = "data-numcampagne";

static GROUP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<optgroup\b([^>]*)>(.*?)</optgroup\s*>").expect("static pattern"));
static OPTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<option\b([^>]*)>([^<]*)</option\s*>").expect("static pattern"));
static ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)([a-z0-9_:-]+)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'=<>`]+))"#).expect("static pattern")
});
static OPTGROUP_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("optgroup").expect("static selector"));
static OPTION_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("option").expect("static selector"));

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct OptionEntry {
    pub id: String,
    pub name: String,
    pub parent_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionGroup {
    pub label: String,
    pub options: Vec<OptionEntry>,
}

/// Groups in document order; serializes as a label → options map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionGroups {
    groups: Vec<OptionGroup>,
}

impl OptionGroups {
    fn push(&mut self, label: String, options: Vec<OptionEntry>) {
        match self.groups.iter_mut().find(|g| g.label == label) {
            Some(existing) => existing.options.extend(options),
            None => self.groups.push(OptionGroup { label, options }),
        }
    }

    pub fn get(&self, label: &str) -> Option<&[OptionEntry]> {
        self.groups
            .iter()
            .find(|g| g.label == label)
            .map(|g| g.options.as_slice())
    }

    pub fn groups(&self) -> &[OptionGroup] {
        &self.groups
    }

    pub fn ids(&self, label: &str) -> Vec<String> {
        self.get(label)
            .map(|opts| opts.iter().map(|o| o.id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn option_count(&self) -> usize {
        self.groups.iter().map(|g| g.options.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

impl Serialize for OptionGroups {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.groups.len()))?;
        for g in &self.groups {
            map.serialize_entry(&g.label, &g.options)?;
        }
        map.end()
    }
}

fn attr(attrs: &str, name: &str) -> Option<String> {
    ATTR_RE.captures_iter(attrs).find_map(|c| {
        let key = c.get(1)?.as_str();
        if !key.eq_ignore_ascii_case(name) {
            return None;
        }
        c.get(2)
            .or_else(|| c.get(3))
            .or_else(|| c.get(4))
            .map(|v| decode_entities(v.as_str()))
    })
}

/// Named and numeric character references, decoded by the same HTML parser the DOM path uses.
fn decode_entities(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    Html::parse_fragment(&s.replace('<', "&lt;"))
        .root_element()
        .text()
        .collect()
}

/// Tolerant text scan. Unclosed groups and options without a value are skipped.
pub fn parse_option_groups_regex(html: &str) -> OptionGroups {
    let mut out = OptionGroups::default();
    for group in GROUP_RE.captures_iter(html) {
        let label = attr(&group[1], "label").unwrap_or_default();
        let options = OPTION_RE
            .captures_iter(&group[2])
            .filter_map(|opt| {
                Some(OptionEntry {
                    id: attr(&opt[1], "value")?,
                    name: decode_entities(&opt[2]).trim().to_string(),
                    parent_id: attr(&opt[1], PARENT_ATTR),
                })
            })
            .collect();
        out.push(label, options);
    }
    out
}

/// Structured DOM query; agrees with the regex scan on well-formed markup.
pub fn parse_option_groups_dom(html: &str) -> OptionGroups {
    let document = Html::parse_fragment(html);
    let mut out = OptionGroups::default();
    for group in document.select(&OPTGROUP_SEL) {
        let label = group.value().attr("label").unwrap_or_default().to_string();
        let options = group
            .select(&OPTION_SEL)
            .filter_map(|opt| {
                let el = opt.value();
                Some(OptionEntry {
                    id: el.attr("value")?.to_string(),
                    name: opt.text().collect::<String>().trim().to_string(),
                    parent_id: el.attr(PARENT_ATTR).map(str::to_string),
                })
            })
            .collect();
        out.push(label, options);
    }
    out
}

/// DOM first, falling back to the regex scan when the DOM finds nothing.
pub fn parse_option_groups(html: &str) -> OptionGroups {
    let groups = parse_option_groups_dom(html);
    if !groups.is_empty() {
        return groups;
    }
    let fallback = parse_option_groups_regex(html);
    if !fallback.is_empty() {
        tracing::debug!(groups = fallback.groups().len(), "Option groups recovered by regex scan");
    }
    fallback
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILTER_HTML: &str = r#"
<select name="selectGroups[]" multiple>
  <optgroup label="Prevoyance">
    <option value="101" data-numcampagne="7">Fichier Janvier</option>
    <option value="102" data-numcampagne="7">Fichier Février &amp; relance</option>
  </optgroup>
  <optgroup label="Mutuelle">
    <option value="201" data-numcampagne="9"> Leads web </option>
  </optgroup>
</select>"#;

    #[test]
    fn groups_and_options_keep_document_order() {
        let groups = parse_option_groups_regex(FILTER_HTML);
        let labels: Vec<_> = groups.groups().iter().map(|g| g.label.as_str()).collect();
        assert_eq!(labels, ["Prevoyance", "Mutuelle"]);
        assert_eq!(groups.ids("Prevoyance"), ["101", "102"]);
        assert_eq!(groups.option_count(), 3);

        let first = &groups.get("Prevoyance").unwrap()[0];
        assert_eq!(first.name, "Fichier Janvier");
        assert_eq!(first.parent_id.as_deref(), Some("7"));
    }

    #[test]
    fn regex_and_dom_agree_on_well_formed_markup() {
        assert_eq!(
            parse_option_groups_regex(FILTER_HTML),
            parse_option_groups_dom(FILTER_HTML)
        );
    }

    #[test]
    fn both_paths_decode_character_references() {
        let html = r#"<optgroup label="Pr&eacute;voyance">
  <option value="1" data-numcampagne="4">F&eacute;vrier &#233;t&#xe9; &amp; co</option>
</optgroup>"#;
        let regex = parse_option_groups_regex(html);
        assert_eq!(regex, parse_option_groups_dom(html));
        let first = &regex.get("Prévoyance").unwrap()[0];
        assert_eq!(first.name, "Février été & co");
    }

    #[test]
    fn both_paths_read_unquoted_attributes() {
        let html = "<optgroup label=Mutuelle><option value=201 data-numcampagne=9>Leads</option></optgroup>";
        let regex = parse_option_groups_regex(html);
        assert_eq!(regex, parse_option_groups_dom(html));
        assert_eq!(regex.ids("Mutuelle"), ["201"]);
        assert_eq!(regex.get("Mutuelle").unwrap()[0].parent_id.as_deref(), Some("9"));
    }

    #[test]
    fn malformed_markup_yields_partial_result() {
        let html = r#"<optgroup label="Ok"><option value="1" data-numcampagne="3">A</option></optgroup>
<optgroup label="Broken"><option value="2">never closed"#;
        let groups = parse_option_groups_regex(html);
        assert_eq!(groups.groups().len(), 1);
        assert_eq!(groups.ids("Ok"), ["1"]);
        assert!(groups.get("Broken").is_none());

        assert!(parse_option_groups("no select here").is_empty());
    }

    #[test]
    fn serializes_as_ordered_map() {
        let json = serde_json::to_string(&parse_option_groups(FILTER_HTML)).unwrap();
        assert!(json.starts_with(r#"{"Prevoyance":[{"id":"101""#));
        assert!(json.find("Prevoyance").unwrap() < json.find("Mutuelle").unwrap());
    }
}
