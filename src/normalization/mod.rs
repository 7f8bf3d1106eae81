//! Source adapters and the Canonical Draft they produce.

pub mod adapter;
pub mod draft;
pub mod fields;
pub mod source_a;
pub mod source_b;

pub use adapter::{adapter_for, AdapterError, AdapterOutput, ItemSkip, SkippedItem, SourceAdapter};
pub use draft::{
    business_key, CanonicalDraft, EntityKind, EntityRef, MultiRole, SingleRole, Source,
    UnknownSource,
};
