//! Source B: every element of `items` may be wrapped as `{"item": {...}}`; people
//! and categories arrive as `[{"data": {"id", "name"}}]`, images as lists of
//! resolution objects.

use serde_json::Value;

use super::adapter::{items_at, AdapterError, ItemSkip, SourceAdapter};
use super::draft::{CanonicalDraft, EntityRef, MultiRole, SingleRole, Source};
use super::fields::{
    entity_refs_at, first_entity_ref, first_scalar, lookup, parse_date, parse_price, ImageTiers,
};

const ITEM_CONTAINERS: [&str; 1] = ["/items"];
const EXTERNAL_ID: [&str; 3] = ["/productid", "/product_id", "/id"];
const TITLE: [&str; 2] = ["/title", "/originaltitle"];
const RELEASE_DATE: [&str; 3] = ["/releasedate", "/opendate", "/release_date"];
const PRICE: [&str; 2] = ["/price", "/saleprice"];
const AFFILIATE_URL: [&str; 3] = ["/affiliateurl", "/affiliate_url", "/url"];

fn single_pointers(role: SingleRole) -> &'static [&'static str] {
    match role {
        SingleRole::Maker => &["/maker", "/makername"],
        SingleRole::Label => &["/label"],
        SingleRole::Series => &["/series"],
        SingleRole::Director => &["/director"],
    }
}

fn multi_pointers(role: MultiRole) -> &'static [&'static str] {
    match role {
        MultiRole::Genre => &["/category", "/genres"],
        MultiRole::Performer => &["/performer", "/performers"],
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SourceBAdapter;

impl SourceBAdapter {
    fn unwrap_item(item: &Value) -> &Value {
        match item.get("item") {
            Some(inner) if inner.is_object() => inner,
            _ => item,
        }
    }

    /// Labels sometimes come as a bare string plus a separate `labelid`.
    fn label_ref(item: &Value) -> Option<EntityRef> {
        let mut label = first_entity_ref(item, single_pointers(SingleRole::Label))?;
        if label.external_id.is_none() {
            label.external_id = first_scalar(item, &["/labelid"]);
        }
        Some(label)
    }
}

impl SourceAdapter for SourceBAdapter {
    fn source(&self) -> Source {
        Source::B
    }

    fn items<'a>(&self, payload: &'a Value) -> Result<&'a [Value], AdapterError> {
        items_at(payload, &ITEM_CONTAINERS)
    }

    fn draft_item(&self, item: &Value) -> Result<CanonicalDraft, ItemSkip> {
        let item = Self::unwrap_item(item);
        if !item.is_object() {
            return Err(ItemSkip::NotAnObject);
        }
        let external_id = first_scalar(item, &EXTERNAL_ID).ok_or(ItemSkip::MissingExternalId)?;
        let title = first_scalar(item, &TITLE).ok_or(ItemSkip::MissingTitle)?;

        let mut draft = CanonicalDraft::new(Source::B, external_id, title);
        draft.release_date = lookup(item, &RELEASE_DATE).and_then(parse_date);
        draft.price = lookup(item, &PRICE).and_then(parse_price);
        draft.affiliate_url = first_scalar(item, &AFFILIATE_URL);
        draft.image_urls = ImageTiers {
            cover: item.pointer("/jacketimage"),
            cover_fallback: item.pointer("/posterimage"),
            samples: item.pointer("/sampleimage"),
            samples_fallback: item.pointer("/thumbnail"),
        }
        .flatten();

        for role in SingleRole::ALL {
            let entity = match role {
                SingleRole::Label => Self::label_ref(item),
                _ => first_entity_ref(item, single_pointers(role)),
            };
            draft.set_single(role, entity);
        }
        for role in MultiRole::ALL {
            draft.set_multi(role, entity_refs_at(item, multi_pointers(role)));
        }
        Ok(draft)
    }
}
