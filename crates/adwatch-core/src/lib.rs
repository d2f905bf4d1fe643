//! Core domain model for adwatch: listings, novelty filtering, report
//! aggregation, and transport-bounded message chunking.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "adwatch-core";

/// Hard per-message character cap of the SMS transport.
pub const MAX_FRAGMENT_LEN: usize = 1600;

/// One extracted classified-ad record. `url` is the identity key within a
/// source; `title` and `price` are opaque display strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub title: String,
    pub price: String,
    pub url: String,
}

/// The fixed set of scraped marketplaces. The string form doubles as the
/// seen-store partition name, so it must stay stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceName {
    #[serde(rename = "ksl")]
    Ksl,
    #[serde(rename = "facebookMarketplace")]
    FacebookMarketplace,
    #[serde(rename = "craigslist")]
    Craigslist,
}

impl SourceName {
    /// Fixed processing order for a run.
    pub const ALL: [SourceName; 3] = [
        SourceName::Ksl,
        SourceName::FacebookMarketplace,
        SourceName::Craigslist,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceName::Ksl => "ksl",
            SourceName::FacebookMarketplace => "facebookMarketplace",
            SourceName::Craigslist => "craigslist",
        }
    }
}

impl fmt::Display for SourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Geographic search parameters shared by every source-specific search URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchArea {
    pub zip: String,
    pub miles: u32,
    pub latitude: f64,
    pub longitude: f64,
    pub radius_km: u32,
    pub craigslist_site: String,
    pub facebook_marketplace_id: String,
}

impl Default for SearchArea {
    fn default() -> Self {
        Self {
            zip: "84093".to_string(),
            miles: 60,
            latitude: 40.5724,
            longitude: -111.86,
            radius_km: 97,
            craigslist_site: "saltlakecity".to_string(),
            facebook_marketplace_id: "105496622817769".to_string(),
        }
    }
}

/// Keeps exactly the listings whose url is not in `seen`, in input order.
/// Does not mutate `seen`; persisting the survivors is the caller's job.
pub fn filter_novel(raw: &[Listing], seen: &HashSet<String>) -> Vec<Listing> {
    raw.iter()
        .filter(|listing| !seen.contains(&listing.url))
        .cloned()
        .collect()
}

/// Collapses within-batch duplicates to the first occurrence by url,
/// preserving order. A duplicated DOM element must produce one persisted
/// entry and one notified entry, not two.
pub fn dedupe_by_url(listings: Vec<Listing>) -> Vec<Listing> {
    let mut kept_urls: HashSet<String> = HashSet::with_capacity(listings.len());
    listings
        .into_iter()
        .filter(|listing| kept_urls.insert(listing.url.clone()))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportSection {
    pub query: String,
    pub listings: Vec<Listing>,
}

/// Ordered accumulation of novel listings across a run, grouped by query.
/// Sections appear in first-processed order; a query that surfaces novel
/// listings from several sources forms a single section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Report {
    sections: Vec<ReportSection>,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends novel listings under `query`. Empty input leaves the report
    /// unchanged; a later batch for an already-present query merges into
    /// the existing section.
    pub fn append_query_results(&mut self, query: &str, novel: &[Listing]) {
        if novel.is_empty() {
            return;
        }
        if let Some(section) = self.sections.iter_mut().find(|s| s.query == query) {
            section.listings.extend_from_slice(novel);
        } else {
            self.sections.push(ReportSection {
                query: query.to_string(),
                listings: novel.to_vec(),
            });
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn sections(&self) -> &[ReportSection] {
        &self.sections
    }

    pub fn listing_count(&self) -> usize {
        self.sections.iter().map(|s| s.listings.len()).sum()
    }

    /// Renders the notification text. One header line per query, then one
    /// block per listing, each block followed by a blank separator line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for section in &self.sections {
            out.push_str(&format!("Query {} Results:\n", section.query));
            for listing in &section.listings {
                out.push_str(&format!(
                    "Title: {}\nPrice: {}\nUrl: {}\n\n",
                    listing.title, listing.price, listing.url
                ));
            }
        }
        out
    }
}

/// Splits `text` into consecutive fragments of at most `max_len` characters.
/// Pure slicing: may split mid-word, never splits a UTF-8 scalar, and
/// concatenating the fragments in order reproduces `text` exactly. Empty
/// input yields no fragments.
pub fn chunk_message(text: &str, max_len: usize) -> Vec<String> {
    assert!(max_len > 0, "fragment limit must be positive");
    let mut fragments = Vec::new();
    let mut current = String::new();
    let mut current_chars = 0usize;
    for ch in text.chars() {
        current.push(ch);
        current_chars += 1;
        if current_chars == max_len {
            fragments.push(std::mem::take(&mut current));
            current_chars = 0;
        }
    }
    if !current.is_empty() {
        fragments.push(current);
    }
    fragments
}
