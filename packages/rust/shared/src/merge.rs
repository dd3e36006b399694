//! Field-level merge rules.
//!
//! Organizers merge by trust tier: an unset field is always filled, a set
//! field is replaced only by a strictly higher tier. Equal tiers keep the
//! existing value, which makes re-enrichment idempotent.
//!
//! Events merge first-non-null-wins: identity scalars that genuinely differ
//! are recorded as [`FieldConflict`]s and lower the record's confidence.

use chrono::NaiveDate;

use crate::normalize::normalize_name;
use crate::types::{
    EventDetails, EventRecord, FieldConflict, OrganizerHints, OrganizerRecord, OrganizerStub,
    Sourced, TrustTier,
};

/// Multiplier applied to an event's confidence per new conflict.
pub const CONFLICT_PENALTY: f32 = 0.8;

// ---------------------------------------------------------------------------
// Trust merge
// ---------------------------------------------------------------------------

/// Result of offering a value to a trust-tagged slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Offer {
    /// Slot was empty.
    Filled,
    /// Higher tier displaced the previous value (returned).
    Replaced(String),
    /// Same value; tier raised if the offer ranked higher.
    Confirmed,
    /// Existing value outranks or ties the offer.
    Kept,
}

/// Offer `value` at `tier` to `slot` under the trust rule.
pub fn offer(slot: &mut Option<Sourced<String>>, value: String, tier: TrustTier) -> Offer {
    match slot {
        None => {
            *slot = Some(Sourced::new(value, tier));
            Offer::Filled
        }
        Some(existing) if existing.value == value => {
            if tier > existing.tier {
                existing.tier = tier;
            }
            Offer::Confirmed
        }
        Some(existing) if tier > existing.tier => {
            let old = std::mem::replace(existing, Sourced::new(value, tier));
            Offer::Replaced(old.value)
        }
        Some(_) => Offer::Kept,
    }
}

/// Offer an EIN. Losing or displaced EINs go to `alternate_eins`.
pub fn offer_ein(record: &mut OrganizerRecord, ein: String, tier: TrustTier) -> Offer {
    let outcome = offer(&mut record.ein, ein.clone(), tier);
    match &outcome {
        Offer::Replaced(old) => {
            record.alternate_eins.insert(old.clone());
        }
        Offer::Kept => {
            record.alternate_eins.insert(ein);
        }
        Offer::Filled | Offer::Confirmed => {}
    }
    if let Some(current) = record.ein_value() {
        let current = current.to_string();
        record.alternate_eins.remove(&current);
    }
    outcome
}

fn offer_opt(slot: &mut Option<Sourced<String>>, incoming: &Option<Sourced<String>>) {
    if let Some(s) = incoming {
        offer(slot, s.value.clone(), s.tier);
    }
}

impl OrganizerRecord {
    /// Merge `other` into `self` field by field under the trust rule.
    pub fn absorb(&mut self, other: &OrganizerRecord) {
        if let Some(ein) = &other.ein {
            offer_ein(self, ein.value.clone(), ein.tier);
        }
        offer_opt(&mut self.legal_name, &other.legal_name);
        offer_opt(&mut self.contact_title, &other.contact_title);
        offer_opt(&mut self.contact_name, &other.contact_name);
        offer_opt(&mut self.contact_email, &other.contact_email);
        offer_opt(&mut self.website, &other.website);
        offer_opt(&mut self.email, &other.email);
        offer_opt(&mut self.phone, &other.phone);

        for (platform, handle) in &other.socials {
            let mut slot = self.socials.remove(platform);
            offer(&mut slot, handle.value.clone(), handle.tier);
            if let Some(s) = slot {
                self.socials.insert(platform.clone(), s);
            }
        }

        self.aliases.extend(other.aliases.iter().cloned());
        let current = self.ein_value().map(str::to_string);
        self.alternate_eins.extend(
            other
                .alternate_eins
                .iter()
                .filter(|e| Some(e.as_str()) != current.as_deref())
                .cloned(),
        );
    }

    /// Record built from event-page hints, every field at the lowest tier.
    pub fn from_stub(stub: &OrganizerStub) -> Self {
        let mut record = Self::named(&stub.name);
        record.absorb_hints(&stub.hints, TrustTier::PageExtraction);
        record
    }

    /// Offer loose hint fields at `tier`.
    pub fn absorb_hints(&mut self, hints: &OrganizerHints, tier: TrustTier) {
        if let Some(ein) = &hints.ein {
            offer_ein(self, ein.clone(), tier);
        }
        let fields = [
            (&mut self.website, &hints.website),
            (&mut self.email, &hints.email),
            (&mut self.phone, &hints.phone),
            (&mut self.contact_name, &hints.contact_name),
            (&mut self.contact_title, &hints.contact_title),
            (&mut self.contact_email, &hints.contact_email),
        ];
        for (slot, value) in fields {
            if let Some(v) = value {
                offer(slot, v.clone(), tier);
            }
        }
        for (platform, handle) in &hints.socials {
            let mut slot = self.socials.remove(platform);
            offer(&mut slot, handle.clone(), tier);
            if let Some(s) = slot {
                self.socials.insert(platform.clone(), s);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Event merge
// ---------------------------------------------------------------------------

fn fill<T: Clone>(slot: &mut Option<T>, incoming: &Option<T>) {
    if slot.is_none() {
        slot.clone_from(incoming);
    }
}

impl EventDetails {
    /// First-non-null-wins fill from `other`.
    pub fn fill_from(&mut self, other: &EventDetails) {
        fill(&mut self.event_type, &other.event_type);
        fill(&mut self.venue_name, &other.venue_name);
        fill(&mut self.venue_address, &other.venue_address);
        fill(&mut self.venue_city, &other.venue_city);
        fill(&mut self.venue_state, &other.venue_state);
        fill(&mut self.venue_zip, &other.venue_zip);
        fill(&mut self.registration_url, &other.registration_url);
        fill(&mut self.sponsorship_url, &other.sponsorship_url);
        fill(&mut self.sponsorship_tiers, &other.sponsorship_tiers);
        fill(&mut self.dress_code, &other.dress_code);
    }
}

impl EventRecord {
    fn flag(&mut self, field: &str, kept: String, rejected: String, source_url: &str) {
        let conflict = FieldConflict {
            field: field.to_string(),
            kept,
            rejected,
            source_url: source_url.to_string(),
        };
        let known = self
            .ambiguities
            .iter()
            .any(|c| c.field == conflict.field && c.rejected == conflict.rejected);
        if !known {
            self.ambiguities.push(conflict);
            self.confidence *= CONFLICT_PENALTY;
        }
    }

    fn merge_text(&mut self, field: &str, incoming: Option<&str>, source_url: &str) {
        let Some(incoming) = incoming else { return };
        let current = match field {
            "name" => &mut self.name,
            _ => &mut self.location,
        };
        match current {
            None => *current = Some(incoming.to_string()),
            Some(existing) if normalize_name(existing) != normalize_name(incoming) => {
                let kept = existing.clone();
                self.flag(field, kept, incoming.to_string(), source_url);
            }
            Some(_) => {}
        }
    }

    fn merge_date(&mut self, incoming: Option<NaiveDate>, source_url: &str) {
        let Some(incoming) = incoming else { return };
        match self.date {
            None => self.date = Some(incoming),
            Some(existing) if existing != incoming => {
                self.flag("date", existing.to_string(), incoming.to_string(), source_url);
            }
            Some(_) => {}
        }
    }

    /// Merge a later partial into this record.
    ///
    /// `source_url` names the page `other` came from and is recorded on any
    /// conflict it causes.
    pub fn absorb(&mut self, other: &EventRecord, source_url: &str) {
        self.merge_text("name", other.name.as_deref(), source_url);
        self.merge_date(other.date, source_url);
        self.merge_text("location", other.location.as_deref(), source_url);
        fill(&mut self.description, &other.description);
        self.details.fill_from(&other.details);

        if let Some(theirs) = &other.organizer {
            if let Some(mine) = self.organizer.as_mut() {
                let hints = &mut mine.hints;
                fill(&mut hints.ein, &theirs.hints.ein);
                fill(&mut hints.website, &theirs.hints.website);
                fill(&mut hints.email, &theirs.hints.email);
                fill(&mut hints.phone, &theirs.hints.phone);
                fill(&mut hints.contact_name, &theirs.hints.contact_name);
                fill(&mut hints.contact_title, &theirs.hints.contact_title);
                fill(&mut hints.contact_email, &theirs.hints.contact_email);
                for (platform, handle) in &theirs.hints.socials {
                    hints
                        .socials
                        .entry(platform.clone())
                        .or_insert_with(|| handle.clone());
                }
            } else {
                self.organizer = Some(theirs.clone());
            }
        }
        fill(&mut self.organizer_ref, &other.organizer_ref);

        self.source_urls.extend(other.source_urls.iter().cloned());
        for conflict in &other.ambiguities {
            if !self.ambiguities.contains(conflict) {
                self.ambiguities.push(conflict.clone());
            }
        }
        if other.confidence < self.confidence {
            self.confidence = other.confidence;
        }
        self.refresh_canonical_id();
    }
}
