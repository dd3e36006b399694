//! Core domain types for the event catalog.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::normalize::{normalize_name, stable_id};

/// Storage row identifier returned by the catalog store.
pub type StoredId = i64;

// ---------------------------------------------------------------------------
// SearchHit
// ---------------------------------------------------------------------------

/// One search result, already normalized. Ephemeral: never persisted beyond
/// the processed-URL set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    /// URL as returned by the provider.
    pub url: String,
    /// Identity key (see [`crate::normalize_url`]).
    pub normalized_url: String,
    pub title: String,
    pub snippet: String,
    /// Name of the provider that returned the hit.
    pub provider: String,
    /// Query string that produced the hit.
    pub query: String,
}

// ---------------------------------------------------------------------------
// Trust tiers
// ---------------------------------------------------------------------------

/// Rank of a data source. Declaration order is the trust order: later
/// variants outrank earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustTier {
    /// Organizer details printed on the event page itself.
    PageExtraction,
    /// Profile fields inferred by the extraction oracle.
    OracleProfile,
    /// Unscoped web search.
    WebSearch,
    CharityNavigator,
    CauseIq,
    /// ProPublica Nonprofit Explorer / IRS exempt-organization search.
    IrsRegistry,
}

impl TrustTier {
    /// Stable identifier used in config and storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PageExtraction => "page_extraction",
            Self::OracleProfile => "oracle_profile",
            Self::WebSearch => "web_search",
            Self::CharityNavigator => "charity_navigator",
            Self::CauseIq => "causeiq",
            Self::IrsRegistry => "irs_registry",
        }
    }
}

impl std::fmt::Display for TrustTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TrustTier {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "page_extraction" => Ok(Self::PageExtraction),
            "oracle_profile" => Ok(Self::OracleProfile),
            "web_search" => Ok(Self::WebSearch),
            "charity_navigator" => Ok(Self::CharityNavigator),
            "causeiq" => Ok(Self::CauseIq),
            "irs_registry" => Ok(Self::IrsRegistry),
            other => Err(format!("unknown trust tier '{other}'")),
        }
    }
}

/// A field value tagged with the tier of the source that wrote it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sourced<T> {
    pub value: T,
    pub tier: TrustTier,
}

impl<T> Sourced<T> {
    pub fn new(value: T, tier: TrustTier) -> Self {
        Self { value, tier }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Secondary event fields. Merged first-non-null-wins, never flagged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub venue_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub venue_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub venue_city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub venue_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub venue_zip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sponsorship_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sponsorship_tiers: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dress_code: Option<String>,
}

/// Organizer details as they appear on an event page, before resolution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrganizerHints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ein: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_email: Option<String>,
    /// Platform (`facebook`, `instagram`, ...) to handle or profile URL.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub socials: BTreeMap<String, String>,
}

/// The organizer named by an event, carried from assembly to resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrganizerStub {
    pub name: String,
    #[serde(default)]
    pub hints: OrganizerHints,
}

/// Two sources disagreed on a field; the first value was kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldConflict {
    pub field: String,
    pub kept: String,
    pub rejected: String,
    /// Page that supplied the rejected value.
    pub source_url: String,
}

/// Identity key of an event: normalized name, date and location.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventKey {
    pub name: String,
    pub date: String,
    pub location: String,
}

impl EventKey {
    /// Single-string form used as the storage key.
    pub fn as_storage_key(&self) -> String {
        format!("{}|{}|{}", self.name, self.date, self.location)
    }

    /// Stable hash of the key, used as the canonical event id.
    pub fn canonical_id(&self) -> String {
        stable_id(&[&self.name, &self.date, &self.location])
    }
}

/// A canonical event assembled from one or more pages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Hash of the identity key; empty until the record has a name.
    pub canonical_id: String,
    pub name: Option<String>,
    pub date: Option<NaiveDate>,
    pub location: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub details: EventDetails,
    /// Organizer as named on the pages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organizer: Option<OrganizerStub>,
    /// Stored organizer row; set by the catalog store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organizer_ref: Option<StoredId>,
    pub source_urls: BTreeSet<String>,
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ambiguities: Vec<FieldConflict>,
}

impl Default for EventRecord {
    fn default() -> Self {
        Self {
            canonical_id: String::new(),
            name: None,
            date: None,
            location: None,
            description: None,
            details: EventDetails::default(),
            organizer: None,
            organizer_ref: None,
            source_urls: BTreeSet::new(),
            confidence: 1.0,
            ambiguities: Vec::new(),
        }
    }
}

impl EventRecord {
    /// Identity key, or `None` while the record has no name.
    pub fn identity_key(&self) -> Option<EventKey> {
        let name = normalize_name(self.name.as_deref()?);
        if name.is_empty() {
            return None;
        }
        Some(EventKey {
            name,
            date: self.date.map(|d| d.to_string()).unwrap_or_default(),
            location: self.location.as_deref().map(normalize_name).unwrap_or_default(),
        })
    }

    /// Recompute `canonical_id` from the identity key.
    pub fn refresh_canonical_id(&mut self) {
        self.canonical_id = self
            .identity_key()
            .map(|k| k.canonical_id())
            .unwrap_or_default();
    }

    /// Whether any merge recorded a conflict on this event.
    pub fn is_ambiguous(&self) -> bool {
        !self.ambiguities.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Organizers
// ---------------------------------------------------------------------------

/// Whether an organizer has a tax ID yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    Resolved,
    /// No source produced an EIN; eligible for a later re-attempt.
    Unresolved,
}

impl ResolutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Resolved => "resolved",
            Self::Unresolved => "unresolved",
        }
    }
}

/// Organizer record with per-field provenance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrganizerRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ein: Option<Sourced<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legal_name: Option<Sourced<String>>,
    #[serde(default)]
    pub aliases: BTreeSet<String>,
    #[serde(default)]
    pub socials: BTreeMap<String, Sourced<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_title: Option<Sourced<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_name: Option<Sourced<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_email: Option<Sourced<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<Sourced<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<Sourced<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<Sourced<String>>,
    /// EINs offered by lower-trust sources and not used.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub alternate_eins: BTreeSet<String>,
}

/// Identity key of an organizer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OrganizerKey {
    Ein(String),
    Name(String),
}

impl OrganizerRecord {
    /// Placeholder record for a name with no source data yet.
    pub fn named(name: &str) -> Self {
        let mut record = Self::default();
        record.aliases.insert(name.trim().to_string());
        record
    }

    pub fn ein_value(&self) -> Option<&str> {
        self.ein.as_ref().map(|s| s.value.as_str())
    }

    /// Best display name: the legal name, else the first alias.
    pub fn display_name(&self) -> Option<&str> {
        self.legal_name
            .as_ref()
            .map(|s| s.value.as_str())
            .or_else(|| self.aliases.iter().next().map(String::as_str))
    }

    /// EIN once resolved; normalized name before.
    pub fn identity_key(&self) -> Option<OrganizerKey> {
        if let Some(ein) = self.ein_value() {
            return Some(OrganizerKey::Ein(ein.to_string()));
        }
        let name = normalize_name(self.display_name()?);
        (!name.is_empty()).then_some(OrganizerKey::Name(name))
    }

    /// Every normalized name this organizer is known by.
    pub fn name_keys(&self) -> BTreeSet<String> {
        self.legal_name
            .iter()
            .map(|s| s.value.as_str())
            .chain(self.aliases.iter().map(String::as_str))
            .map(normalize_name)
            .filter(|k| !k.is_empty())
            .collect()
    }

    pub fn status(&self) -> ResolutionStatus {
        if self.ein.is_some() {
            ResolutionStatus::Resolved
        } else {
            ResolutionStatus::Unresolved
        }
    }

    /// EIN, legal name, at least one social and a contact title are all set.
    pub fn has_high_value_fields(&self) -> bool {
        self.ein.is_some()
            && self.legal_name.is_some()
            && !self.socials.is_empty()
            && self.contact_title.is_some()
    }
}

/// One stored event with its organizer, as handed to exporters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub event_id: StoredId,
    pub event: EventRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organizer_id: Option<StoredId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organizer: Option<OrganizerRecord>,
}
