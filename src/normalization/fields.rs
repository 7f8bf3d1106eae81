//! Defensive field extraction shared by the vendor adapters.
//!
//! Nothing in here fails: unparseable values come back as `None` or an empty
//! list, and it is up to the adapter to decide whether a missing value makes
//! the whole item unusable.

use chrono::{DateTime, NaiveDate};
use indexmap::IndexSet;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

use super::draft::EntityRef;

/// Resolution keys in preference order (largest first). Vendors misspell "medium".
pub const RESOLUTION_KEYS: [&str; 6] = ["large", "medium", "midium", "small", "list", "thumb"];

static PRICE_RE: OnceLock<Regex> = OnceLock::new();
static DATE_RE: OnceLock<Regex> = OnceLock::new();

fn price_re() -> &'static Regex {
    PRICE_RE.get_or_init(|| Regex::new(r"-?\d[\d,]*").expect("static price regex"))
}

fn date_re() -> &'static Regex {
    DATE_RE.get_or_init(|| {
        Regex::new(
            r"^(\d{4})([-/.])(\d{1,2})([-/.])(\d{1,2})(?:[ T]\d{1,2}:\d{2}(?::\d{2}(?:\.\d+)?)?(?:Z|[+-]\d{2}:?\d{2})?)?$",
        )
        .expect("static date regex")
    })
}

/// First non-null value among JSON pointers (e.g. `/prices/price`).
pub fn lookup<'a>(item: &'a Value, pointers: &[&str]) -> Option<&'a Value> {
    pointers
        .iter()
        .filter_map(|p| item.pointer(p))
        .find(|v| !v.is_null())
}

/// Trimmed non-empty string, or an integer rendered as text.
pub fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let t = s.trim();
            (!t.is_empty()).then(|| t.to_string())
        }
        Value::Number(n) => match n.as_i64() {
            Some(i) => Some(i.to_string()),
            None => n.as_f64().filter(|f| f.is_finite()).map(|f| f.to_string()),
        },
        _ => None,
    }
}

/// First pointer that yields a usable scalar.
pub fn first_scalar(item: &Value, pointers: &[&str]) -> Option<String> {
    pointers
        .iter()
        .filter_map(|p| item.pointer(p))
        .find_map(scalar_string)
}

/// Parses vendor prices such as `1980`, `"1,980"`, `"300~"` or `"¥1,980円"`.
///
/// Strings without digits, negative amounts and non-scalar values give `None`.
pub fn parse_price(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                return (i >= 0).then_some(i);
            }
            n.as_f64()
                .filter(|f| f.is_finite() && *f >= 0.0 && *f <= i64::MAX as f64)
                .map(|f| f.trunc() as i64)
        }
        Value::String(s) => {
            let m = price_re().find(s)?;
            let digits = m.as_str();
            if digits.starts_with('-') {
                return None;
            }
            digits.replace(',', "").parse::<i64>().ok()
        }
        _ => None,
    }
}

/// Parses `YYYY-MM-DD`, `YYYY/MM/DD` (optionally followed by a time) or RFC 3339.
pub fn parse_date(value: &Value) -> Option<NaiveDate> {
    let raw = value.as_str()?.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.date_naive());
    }
    let caps = date_re().captures(raw)?;
    // Mixed separators ("2023.01-02") are not a date.
    if caps.get(2)?.as_str() != caps.get(4)?.as_str() {
        return None;
    }
    let year: i32 = caps.get(1)?.as_str().parse().ok()?;
    let month: u32 = caps.get(3)?.as_str().parse().ok()?;
    let day: u32 = caps.get(5)?.as_str().parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Flattens the entity shapes vendors use into references:
/// `"Acme"`, `{"id": 1, "name": "Acme"}`, `{"data": {"name": "Acme"}}`, or arrays of those.
pub fn entity_refs(value: &Value) -> Vec<EntityRef> {
    match value {
        Value::String(s) => EntityRef::named(s).into_iter().collect(),
        Value::Array(items) => items.iter().flat_map(entity_refs).collect(),
        Value::Object(map) => {
            if let Some(inner) = map.get("data") {
                if inner.is_object() {
                    return entity_refs(inner);
                }
            }
            let name = map.get("name").and_then(Value::as_str);
            let external_id = map.get("id").and_then(scalar_string);
            name.and_then(|n| EntityRef::new(n, external_id))
                .into_iter()
                .collect()
        }
        _ => Vec::new(),
    }
}

/// Entity references from the first pointer that yields any.
pub fn entity_refs_at(item: &Value, pointers: &[&str]) -> Vec<EntityRef> {
    pointers
        .iter()
        .filter_map(|p| item.pointer(p))
        .map(entity_refs)
        .find(|refs| !refs.is_empty())
        .unwrap_or_default()
}

/// First entity reference among pointers; extra values for single-valued roles are ignored.
pub fn first_entity_ref(item: &Value, pointers: &[&str]) -> Option<EntityRef> {
    entity_refs_at(item, pointers).into_iter().next()
}

/// Normalizes a single URL: trims, upgrades protocol-relative links, rejects non-http values.
pub fn normalize_url(raw: &str) -> Option<String> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Some(rest) = s.strip_prefix("//") {
        return Some(format!("https://{rest}"));
    }
    if s.starts_with("http://") || s.starts_with("https://") {
        return Some(s.to_string());
    }
    None
}

/// Best-resolution URL from a string, an object of resolution keys, or the first array element.
pub fn best_resolution_url(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => normalize_url(s),
        Value::Object(map) => RESOLUTION_KEYS
            .iter()
            .filter_map(|k| map.get(*k))
            .find_map(best_resolution_url),
        Value::Array(items) => items.iter().find_map(best_resolution_url),
        _ => None,
    }
}

/// Every URL in a sample list: plain strings, `{"image": url}` objects or resolution objects.
pub fn url_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::Object(map) => map
                    .get("image")
                    .and_then(best_resolution_url)
                    .or_else(|| best_resolution_url(item)),
                other => best_resolution_url(other),
            })
            .collect(),
        Value::Object(map) => map.get("image").map(url_list).unwrap_or_default(),
        Value::String(s) => normalize_url(s).into_iter().collect(),
        _ => Vec::new(),
    }
}

/// Image sources for one item, as the vendor names them.
///
/// Each tier uses its primary field, or its fallback when the primary yields nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageTiers<'a> {
    pub cover: Option<&'a Value>,
    pub cover_fallback: Option<&'a Value>,
    pub samples: Option<&'a Value>,
    pub samples_fallback: Option<&'a Value>,
}

impl ImageTiers<'_> {
    /// Cover first, then samples; duplicates dropped, first position kept.
    pub fn flatten(&self) -> Vec<String> {
        let mut out: IndexSet<String> = IndexSet::new();

        let cover = self
            .cover
            .and_then(best_resolution_url)
            .or_else(|| self.cover_fallback.and_then(best_resolution_url));
        out.extend(cover);

        let primary_samples = self.samples.map(url_list).unwrap_or_default();
        if primary_samples.is_empty() {
            out.extend(self.samples_fallback.map(url_list).unwrap_or_default());
        } else {
            out.extend(primary_samples);
        }

        out.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prices_reduce_defensively() {
        assert_eq!(parse_price(&json!(1980)), Some(1980));
        assert_eq!(parse_price(&json!(1980.9)), Some(1980));
        assert_eq!(parse_price(&json!("1,980")), Some(1980));
        assert_eq!(parse_price(&json!("300~")), Some(300));
        assert_eq!(parse_price(&json!("¥2,480円")), Some(2480));
        assert_eq!(parse_price(&json!("free")), None);
        assert_eq!(parse_price(&json!("")), None);
        assert_eq!(parse_price(&json!(-5)), None);
        assert_eq!(parse_price(&json!("-5")), None);
        assert_eq!(parse_price(&json!({"price": 1})), None);
    }

    #[test]
    fn dates_accept_common_vendor_formats() {
        let d = NaiveDate::from_ymd_opt(2023, 1, 2).unwrap();
        assert_eq!(parse_date(&json!("2023-01-02")), Some(d));
        assert_eq!(parse_date(&json!("2023-01-02 10:00:00")), Some(d));
        assert_eq!(parse_date(&json!("2023/1/2")), Some(d));
        assert_eq!(parse_date(&json!("2023-01-02T10:00:00+09:00")), Some(d));
        assert_eq!(parse_date(&json!("2023.01.02")), Some(d));
        assert_eq!(parse_date(&json!("2023-01-02T10:00")), Some(d));
        assert_eq!(parse_date(&json!("2023-13-40")), None);
        assert_eq!(parse_date(&json!("2023-01-123")), None);
        assert_eq!(parse_date(&json!("2023-01-02garbage")), None);
        assert_eq!(parse_date(&json!("2023-01-02 later")), None);
        assert_eq!(parse_date(&json!("2023.01-02")), None);
        assert_eq!(parse_date(&json!("soon")), None);
        assert_eq!(parse_date(&json!(20230102)), None);
    }

    #[test]
    fn entity_shapes_flatten_to_refs() {
        let refs = entity_refs(&json!([
            "Drama",
            {"id": 7, "name": " Comedy "},
            {"data": {"id": "p1", "name": "Jane Roe"}},
            {"id": 9},
            42
        ]));
        let names: Vec<&str> = refs.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["Drama", "Comedy", "Jane Roe"]);
        assert_eq!(refs[1].external_id.as_deref(), Some("7"));
        assert_eq!(refs[2].external_id.as_deref(), Some("p1"));
    }

    #[test]
    fn entity_refs_at_skips_empty_candidates() {
        let item = json!({"maker": "  ", "iteminfo": {"maker": [{"name": "Acme"}]}});
        let r = first_entity_ref(&item, &["/maker", "/iteminfo/maker"]).unwrap();
        assert_eq!(r.name, "Acme");
    }

    #[test]
    fn scalars_render_numbers_and_reject_blanks() {
        assert_eq!(scalar_string(&json!(" x1 ")), Some("x1".into()));
        assert_eq!(scalar_string(&json!(123)), Some("123".into()));
        assert_eq!(scalar_string(&json!("  ")), None);
        assert_eq!(scalar_string(&json!(null)), None);
        let item = json!({"content_id": "", "product_id": 55});
        assert_eq!(first_scalar(&item, &["/content_id", "/product_id"]), Some("55".into()));
    }

    #[test]
    fn image_tiers_prefer_primary_and_dedupe() {
        let cover = json!({"small": "https://img/s.jpg", "large": "https://img/l.jpg"});
        let samples = json!({"image": ["https://img/1.jpg", "//img/2.jpg", "https://img/l.jpg"]});
        let fallback_samples = json!({"image": ["https://img/s1.jpg"]});
        let urls = ImageTiers {
            cover: Some(&cover),
            cover_fallback: None,
            samples: Some(&samples),
            samples_fallback: Some(&fallback_samples),
        }
        .flatten();
        assert_eq!(
            urls,
            vec!["https://img/l.jpg", "https://img/1.jpg", "https://img/2.jpg"]
        );
    }

    #[test]
    fn image_tiers_fall_back_when_primary_absent() {
        let poster = json!([{"midium": "https://img/m.jpg", "small": "https://img/s.jpg"}]);
        let thumbs = json!([{"image": "https://img/t1.jpg"}, {"image": "ftp://nope"}]);
        let urls = ImageTiers {
            cover: Some(&json!([])),
            cover_fallback: Some(&poster),
            samples: None,
            samples_fallback: Some(&thumbs),
        }
        .flatten();
        assert_eq!(urls, vec!["https://img/m.jpg", "https://img/t1.jpg"]);
    }
}
