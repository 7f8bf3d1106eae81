//! Source A: catalog-style feed. Items live at `items` (or `result.items` in the
//! full API envelope); entity fields are either flat on the item or grouped
//! under `iteminfo` as `{id, name}` lists.

use serde_json::Value;

use super::adapter::{items_at, AdapterError, ItemSkip, SourceAdapter};
use super::draft::{CanonicalDraft, MultiRole, SingleRole, Source};
use super::fields::{
    entity_refs_at, first_entity_ref, first_scalar, lookup, parse_date, parse_price, ImageTiers,
};

const ITEM_CONTAINERS: [&str; 2] = ["/items", "/result/items"];
const EXTERNAL_ID: [&str; 3] = ["/id", "/content_id", "/product_id"];
const TITLE: [&str; 1] = ["/title"];
const RELEASE_DATE: [&str; 2] = ["/date", "/release_date"];
const PRICE: [&str; 3] = ["/price", "/prices/price", "/prices/list_price"];
const AFFILIATE_URL: [&str; 4] = ["/affiliateURL", "/affiliate_url", "/URL", "/url"];

fn single_pointers(role: SingleRole) -> &'static [&'static str] {
    match role {
        SingleRole::Maker => &["/maker", "/iteminfo/maker"],
        SingleRole::Label => &["/label", "/iteminfo/label"],
        SingleRole::Series => &["/series", "/iteminfo/series"],
        SingleRole::Director => &["/director", "/iteminfo/director"],
    }
}

fn multi_pointers(role: MultiRole) -> &'static [&'static str] {
    match role {
        MultiRole::Genre => &["/genres", "/genre", "/iteminfo/genre"],
        MultiRole::Performer => &[
            "/performers",
            "/actress",
            "/iteminfo/actress",
            "/iteminfo/performer",
        ],
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SourceAAdapter;

impl SourceAdapter for SourceAAdapter {
    fn source(&self) -> Source {
        Source::A
    }

    fn items<'a>(&self, payload: &'a Value) -> Result<&'a [Value], AdapterError> {
        items_at(payload, &ITEM_CONTAINERS)
    }

    fn draft_item(&self, item: &Value) -> Result<CanonicalDraft, ItemSkip> {
        if !item.is_object() {
            return Err(ItemSkip::NotAnObject);
        }
        let external_id = first_scalar(item, &EXTERNAL_ID).ok_or(ItemSkip::MissingExternalId)?;
        let title = first_scalar(item, &TITLE).ok_or(ItemSkip::MissingTitle)?;

        let mut draft = CanonicalDraft::new(Source::A, external_id, title);
        draft.release_date = lookup(item, &RELEASE_DATE).and_then(parse_date);
        draft.price = lookup(item, &PRICE).and_then(parse_price);
        draft.affiliate_url = first_scalar(item, &AFFILIATE_URL);
        draft.image_urls = ImageTiers {
            cover: item.pointer("/imageURL"),
            cover_fallback: item.pointer("/image"),
            samples: item.pointer("/sampleImageURL/sample_l"),
            samples_fallback: item.pointer("/sampleImageURL/sample_s"),
        }
        .flatten();

        for role in SingleRole::ALL {
            draft.set_single(role, first_entity_ref(item, single_pointers(role)));
        }
        for role in MultiRole::ALL {
            draft.set_multi(role, entity_refs_at(item, multi_pointers(role)));
        }
        Ok(draft)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::raw_store::RawRecord;
    use chrono::NaiveDate;
    use serde_json::json;

    #[test]
    fn flat_item_becomes_draft() {
        let payload = json!({
            "items": [{"id": "x1", "title": "Foo", "maker": "Acme", "genres": ["Drama", "Comedy"]}]
        });
        let raw = RawRecord::fixture(1, Source::A, &payload.to_string());
        let out = SourceAAdapter.normalize(&raw).unwrap();
        assert!(out.skipped.is_empty());
        let draft = &out.drafts[0];
        assert_eq!(draft.business_key(), "A_x1");
        assert_eq!(draft.title, "Foo");
        assert_eq!(draft.single_name(SingleRole::Maker), Some("Acme"));
        assert_eq!(draft.single_name(SingleRole::Label), None);
        assert_eq!(draft.multi_names(MultiRole::Genre), vec!["Drama", "Comedy"]);
        assert_eq!(draft.price, None);
        assert!(draft.image_urls.is_empty());
    }

    #[test]
    fn envelope_item_with_iteminfo_and_assets() {
        let item = json!({
            "content_id": "abc00123",
            "title": "  Bar  ",
            "date": "2023-04-05 10:00:00",
            "prices": {"price": "1,980~"},
            "affiliateURL": "https://aff.example/abc00123",
            "imageURL": {
                "list": "https://img.example/abc00123pt.jpg",
                "small": "https://img.example/abc00123ps.jpg",
                "large": "https://img.example/abc00123pl.jpg"
            },
            "sampleImageURL": {
                "sample_s": {"image": ["https://img.example/abc00123-1.jpg"]},
                "sample_l": {"image": [
                    "https://img.example/abc00123jp-1.jpg",
                    "https://img.example/abc00123jp-2.jpg"
                ]}
            },
            "iteminfo": {
                "maker": [{"id": 45, "name": "Acme"}],
                "label": [{"id": 9, "name": "Acme Gold"}],
                "series": [{"id": 3, "name": "Night Shift"}],
                "director": [{"id": 1, "name": "J. Doe"}, {"id": 2, "name": "R. Roe"}],
                "genre": [{"id": 10, "name": "Drama"}],
                "actress": [{"id": 100, "name": "Jane Roe"}, {"id": 101, "name": "Ann Poe"}]
            }
        });
        let payload = json!({"result": {"status": 200, "items": [item]}});
        let raw = RawRecord::fixture(2, Source::A, &payload.to_string());
        let out = SourceAAdapter.normalize(&raw).unwrap();
        let draft = &out.drafts[0];

        assert_eq!(draft.external_product_id, "abc00123");
        assert_eq!(draft.title, "Bar");
        assert_eq!(draft.release_date, NaiveDate::from_ymd_opt(2023, 4, 5));
        assert_eq!(draft.price, Some(1980));
        assert_eq!(draft.affiliate_url.as_deref(), Some("https://aff.example/abc00123"));
        assert_eq!(
            draft.image_urls,
            vec![
                "https://img.example/abc00123pl.jpg",
                "https://img.example/abc00123jp-1.jpg",
                "https://img.example/abc00123jp-2.jpg",
            ]
        );
        assert_eq!(draft.single_name(SingleRole::Director), Some("J. Doe"));
        assert_eq!(
            draft.singles[&SingleRole::Maker].external_id.as_deref(),
            Some("45")
        );
        assert_eq!(
            draft.multi_names(MultiRole::Performer),
            vec!["Jane Roe", "Ann Poe"]
        );
    }

    #[test]
    fn bad_items_are_skipped_without_losing_siblings() {
        let payload = json!({"items": [
            {"id": "ok1", "title": "Kept"},
            {"title": "No id"},
            {"id": "x2", "title": "   "},
            "junk",
            {"id": 77, "title": "Numeric id", "price": "TBD", "date": "someday"}
        ]});
        let raw = RawRecord::fixture(3, Source::A, &payload.to_string());
        let out = SourceAAdapter.normalize(&raw).unwrap();

        let ids: Vec<&str> = out
            .drafts
            .iter()
            .map(|d| d.external_product_id.as_str())
            .collect();
        assert_eq!(ids, vec!["ok1", "77"]);
        assert_eq!(out.drafts[1].price, None);
        assert_eq!(out.drafts[1].release_date, None);
        let reasons: Vec<ItemSkip> = out.skipped.iter().map(|s| s.reason).collect();
        assert_eq!(
            reasons,
            vec![
                ItemSkip::MissingExternalId,
                ItemSkip::MissingTitle,
                ItemSkip::NotAnObject
            ]
        );
    }

    #[test]
    fn missing_container_is_malformed_but_empty_container_is_not() {
        let raw = RawRecord::fixture(4, Source::A, r#"{"result": {"status": 500}}"#);
        assert!(matches!(
            SourceAAdapter.normalize(&raw),
            Err(AdapterError::Malformed(_))
        ));

        let raw = RawRecord::fixture(5, Source::A, r#"{"items": []}"#);
        assert!(SourceAAdapter.normalize(&raw).unwrap().is_empty());
    }
}
