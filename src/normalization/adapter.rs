//! The `SourceAdapter` boundary: the only place that knows vendor payload shapes.

use serde_json::Value;
use std::fmt;

use super::draft::{CanonicalDraft, Source};
use super::{source_a::SourceAAdapter, source_b::SourceBAdapter};
use crate::database_ops::raw_store::RawRecord;

/// Record-level adapter failure. The record's unit of work rolls back and it stays unprocessed.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("payload is not valid JSON: {0}")]
    Undecodable(#[from] serde_json::Error),
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("record source {record} does not match adapter source {adapter}")]
    SourceMismatch { record: Source, adapter: Source },
}

/// Why a single item inside an otherwise valid payload was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemSkip {
    NotAnObject,
    MissingExternalId,
    MissingTitle,
}

impl fmt::Display for ItemSkip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ItemSkip::NotAnObject => "item is not an object",
            ItemSkip::MissingExternalId => "missing external product id",
            ItemSkip::MissingTitle => "missing title",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedItem {
    pub index: usize,
    pub reason: ItemSkip,
}

/// Drafts plus the items that could not be used.
#[derive(Debug, Default)]
pub struct AdapterOutput {
    pub drafts: Vec<CanonicalDraft>,
    pub skipped: Vec<SkippedItem>,
}

impl AdapterOutput {
    /// No usable item: the record is classified empty rather than failed.
    pub fn is_empty(&self) -> bool {
        self.drafts.is_empty()
    }
}

pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> Source;

    /// Turns one vendor item into a draft, or explains why it cannot.
    fn draft_item(&self, item: &Value) -> Result<CanonicalDraft, ItemSkip>;

    /// Locates the item list inside a decoded payload.
    fn items<'a>(&self, payload: &'a Value) -> Result<&'a [Value], AdapterError>;

    /// Parses a raw payload into drafts; one bad item never discards its siblings.
    fn normalize(&self, raw: &RawRecord) -> Result<AdapterOutput, AdapterError> {
        if raw.source != self.source() {
            return Err(AdapterError::SourceMismatch {
                record: raw.source,
                adapter: self.source(),
            });
        }
        let payload: Value = serde_json::from_str(&raw.payload)?;
        let items = self.items(&payload)?;

        let mut out = AdapterOutput::default();
        for (index, item) in items.iter().enumerate() {
            match self.draft_item(item) {
                Ok(draft) => out.drafts.push(draft),
                Err(reason) => {
                    tracing::warn!(
                        raw_record_id = raw.id,
                        source = %raw.source,
                        item_index = index,
                        reason = %reason,
                        "adapter: skipping unusable item"
                    );
                    out.skipped.push(SkippedItem { index, reason });
                }
            }
        }
        Ok(out)
    }
}

static SOURCE_A: SourceAAdapter = SourceAAdapter;
static SOURCE_B: SourceBAdapter = SourceBAdapter;

pub fn adapter_for(source: Source) -> &'static dyn SourceAdapter {
    match source {
        Source::A => &SOURCE_A,
        Source::B => &SOURCE_B,
    }
}

/// Shared helper: the payload must be an object whose container at one of `pointers` is an array.
pub(crate) fn items_at<'a>(
    payload: &'a Value,
    pointers: &[&str],
) -> Result<&'a [Value], AdapterError> {
    if !payload.is_object() {
        return Err(AdapterError::Malformed("payload is not a JSON object".into()));
    }
    for pointer in pointers {
        match payload.pointer(pointer) {
            Some(Value::Array(items)) => return Ok(items.as_slice()),
            Some(Value::Null) | None => continue,
            Some(_) => {
                return Err(AdapterError::Malformed(format!(
                    "{pointer} is not an array"
                )))
            }
        }
    }
    Err(AdapterError::Malformed(format!(
        "no item list at any of {}",
        pointers.join(", ")
    )))
}
