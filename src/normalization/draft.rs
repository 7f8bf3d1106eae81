//! Canonical Draft: one product as an adapter sees it, before any entity
//! name has been turned into a master-row id.

use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Upstream vendor namespace. Master entities and business keys are scoped by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Source {
    A,
    B,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown source {0:?}; expected A or B")]
pub struct UnknownSource(pub String);

impl Source {
    pub const ALL: [Source; 2] = [Source::A, Source::B];

    pub fn as_str(self) -> &'static str {
        match self {
            Source::A => "A",
            Source::B => "B",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = UnknownSource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Ok(Source::A),
            "B" => Ok(Source::B),
            _ => Err(UnknownSource(s.to_string())),
        }
    }
}

/// The six master-entity kinds. Each has its own table, unique on `(source, name)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum EntityKind {
    Maker,
    Label,
    Series,
    Director,
    Genre,
    Performer,
}

impl EntityKind {
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Maker,
        EntityKind::Label,
        EntityKind::Series,
        EntityKind::Director,
        EntityKind::Genre,
        EntityKind::Performer,
    ];

    /// Table holding master rows of this kind. Static, so safe to splice into SQL.
    pub fn table(self) -> &'static str {
        match self {
            EntityKind::Maker => "makers",
            EntityKind::Label => "labels",
            EntityKind::Series => "series",
            EntityKind::Director => "directors",
            EntityKind::Genre => "genres",
            EntityKind::Performer => "performers",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Maker => "maker",
            EntityKind::Label => "label",
            EntityKind::Series => "series",
            EntityKind::Director => "director",
            EntityKind::Genre => "genre",
            EntityKind::Performer => "performer",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single-valued product roles, stored as nullable FK columns on `products`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SingleRole {
    Maker,
    Label,
    Series,
    Director,
}

impl SingleRole {
    pub const ALL: [SingleRole; 4] = [
        SingleRole::Maker,
        SingleRole::Label,
        SingleRole::Series,
        SingleRole::Director,
    ];

    pub fn kind(self) -> EntityKind {
        match self {
            SingleRole::Maker => EntityKind::Maker,
            SingleRole::Label => EntityKind::Label,
            SingleRole::Series => EntityKind::Series,
            SingleRole::Director => EntityKind::Director,
        }
    }

    /// FK column on `products`.
    pub fn column(self) -> &'static str {
        match self {
            SingleRole::Maker => "maker_id",
            SingleRole::Label => "label_id",
            SingleRole::Series => "series_id",
            SingleRole::Director => "director_id",
        }
    }
}

/// Multi-valued product roles, stored as link rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MultiRole {
    Genre,
    Performer,
}

impl MultiRole {
    pub const ALL: [MultiRole; 2] = [MultiRole::Genre, MultiRole::Performer];

    pub fn kind(self) -> EntityKind {
        match self {
            MultiRole::Genre => EntityKind::Genre,
            MultiRole::Performer => EntityKind::Performer,
        }
    }

    /// Link table and the column naming the entity side.
    pub fn link_table(self) -> (&'static str, &'static str) {
        match self {
            MultiRole::Genre => ("product_genres", "genre_id"),
            MultiRole::Performer => ("product_performers", "performer_id"),
        }
    }
}

/// An entity mention that has not been resolved to a master-row id yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRef {
    pub name: String,
    pub external_id: Option<String>,
}

impl EntityRef {
    /// Builds a reference from a raw vendor name. Returns `None` for blank names.
    pub fn new(raw_name: &str, external_id: Option<String>) -> Option<Self> {
        let name = normalize_entity_name(raw_name)?;
        let external_id = external_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty());
        Some(Self { name, external_id })
    }

    pub fn named(raw_name: &str) -> Option<Self> {
        Self::new(raw_name, None)
    }
}

/// Trim and collapse inner whitespace runs; blank names yield `None`.
pub fn normalize_entity_name(raw: &str) -> Option<String> {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

pub fn business_key(source: Source, external_product_id: &str) -> String {
    format!("{}_{}", source.as_str(), external_product_id)
}

/// Intermediate, not-yet-persisted product produced by a `SourceAdapter`.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalDraft {
    pub source: Source,
    pub external_product_id: String,
    pub title: String,
    pub release_date: Option<NaiveDate>,
    pub price: Option<i64>,
    pub affiliate_url: Option<String>,
    pub image_urls: Vec<String>,
    pub singles: BTreeMap<SingleRole, EntityRef>,
    pub multis: BTreeMap<MultiRole, Vec<EntityRef>>,
}

impl CanonicalDraft {
    pub fn new(source: Source, external_product_id: String, title: String) -> Self {
        Self {
            source,
            external_product_id,
            title,
            release_date: None,
            price: None,
            affiliate_url: None,
            image_urls: Vec::new(),
            singles: BTreeMap::new(),
            multis: BTreeMap::new(),
        }
    }

    pub fn business_key(&self) -> String {
        business_key(self.source, &self.external_product_id)
    }

    pub fn set_single(&mut self, role: SingleRole, entity: Option<EntityRef>) {
        match entity {
            Some(e) => {
                self.singles.insert(role, e);
            }
            None => {
                self.singles.remove(&role);
            }
        }
    }

    /// Stores the multi-valued role, dropping repeated names (first spelling wins).
    pub fn set_multi(&mut self, role: MultiRole, entities: Vec<EntityRef>) {
        let mut seen = std::collections::HashSet::new();
        let deduped: Vec<EntityRef> = entities
            .into_iter()
            .filter(|e| seen.insert(e.name.clone()))
            .collect();
        if deduped.is_empty() {
            self.multis.remove(&role);
        } else {
            self.multis.insert(role, deduped);
        }
    }

    pub fn single_name(&self, role: SingleRole) -> Option<&str> {
        self.singles.get(&role).map(|e| e.name.as_str())
    }

    pub fn multi_names(&self, role: MultiRole) -> Vec<&str> {
        self.multis
            .get(&role)
            .map(|v| v.iter().map(|e| e.name.as_str()).collect())
            .unwrap_or_default()
    }

    /// Every entity mention of the given kind, in draft order.
    pub fn refs_of_kind(&self, kind: EntityKind) -> Vec<&EntityRef> {
        let mut out: Vec<&EntityRef> = self
            .singles
            .iter()
            .filter(|(role, _)| role.kind() == kind)
            .map(|(_, e)| e)
            .collect();
        for (role, refs) in &self.multis {
            if role.kind() == kind {
                out.extend(refs.iter());
            }
        }
        out
    }
}
