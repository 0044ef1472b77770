use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An inclusive range of listing page numbers.
///
/// This is the unit of assignment between the manager and a general worker,
/// stored in the coordinator as JSON `{"start":n,"end":n}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRange {
    pub start: u64,
    pub end: u64,
}

impl PageRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Number of pages covered, zero for an inverted range.
    pub fn len(&self) -> u64 {
        if self.end < self.start {
            0
        } else {
            self.end - self.start + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, page: u64) -> bool {
        page >= self.start && page <= self.end
    }

    /// Iterate the pages of this range in ascending order.
    pub fn pages(&self) -> impl Iterator<Item = u64> {
        self.start..=self.end
    }

    /// Split into consecutive windows of at most `size` pages.
    pub fn windows(&self, size: u64) -> Vec<PageRange> {
        assert!(size > 0, "window size must be positive");
        let mut out = Vec::new();
        let mut cursor = self.start;
        while cursor <= self.end {
            let end = (cursor + size - 1).min(self.end);
            out.push(PageRange::new(cursor, end));
            cursor = end + 1;
        }
        out
    }
}

impl std::fmt::Display for PageRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}..{}]", self.start, self.end)
    }
}

/// A single item extracted from a listing page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingRecord {
    /// Primary identifier, a 10-character alphanumeric key.
    pub listing_id: String,

    /// Canonical URL of the item's detail page.
    pub url: String,

    /// Display title as rendered on the listing.
    pub title: String,

    /// 1-based listing page this record was extracted from.
    pub page: u64,

    /// Price in minor units (e.g. cents), when the listing shows one.
    pub price_minor: Option<i64>,

    /// ISO 4217 currency code accompanying the price.
    pub currency: Option<String>,

    /// Star rating, typically 0.0-5.0.
    pub rating: Option<f64>,

    /// Number of ratings behind the score.
    pub rating_count: Option<i64>,

    /// Image URLs in display order.
    pub image_urls: Vec<String>,
}

impl ListingRecord {
    /// Identifiers are expected to be exactly 10 alphanumeric characters.
    pub fn has_valid_id(&self) -> bool {
        self.listing_id.len() == 10 && self.listing_id.chars().all(|c| c.is_ascii_alphanumeric())
    }
}

/// Outcome recorded for every persistence attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Success,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Success => "success",
            EventStatus::Failed => "failed",
        }
    }
}

/// Append-only audit entry written alongside each upsert attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlEvent {
    pub listing_id: Option<String>,
    pub url: String,
    pub page: u64,
    pub status: EventStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl CrawlEvent {
    pub fn success(listing_id: &str, url: &str, page: u64) -> Self {
        Self {
            listing_id: Some(listing_id.to_string()),
            url: url.to_string(),
            page,
            status: EventStatus::Success,
            error: None,
            created_at: Utc::now(),
        }
    }

    pub fn failed(listing_id: Option<&str>, url: &str, page: u64, error: &str) -> Self {
        Self {
            listing_id: listing_id.map(str::to_string),
            url: url.to_string(),
            page,
            status: EventStatus::Failed,
            error: Some(error.to_string()),
            created_at: Utc::now(),
        }
    }
}

/// Browser cookie as shared through the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    #[serde(default = "default_cookie_path")]
    pub path: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
    /// Unix seconds; `None` for session cookies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<i64>,
}

fn default_cookie_path() -> String {
    "/".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_len_and_windows() {
        let r = PageRange::new(1, 120);
        assert_eq!(r.len(), 120);
        let windows = r.windows(50);
        assert_eq!(
            windows,
            vec![
                PageRange::new(1, 50),
                PageRange::new(51, 100),
                PageRange::new(101, 120)
            ]
        );
    }

    #[test]
    fn range_single_page() {
        let r = PageRange::new(7, 7);
        assert_eq!(r.len(), 1);
        assert!(r.contains(7));
        assert_eq!(r.windows(50), vec![r]);
    }

    #[test]
    fn listing_id_shape() {
        let mut rec = ListingRecord {
            listing_id: "B0C1D2E3F4".to_string(),
            url: "https://shop.example.com/item/B0C1D2E3F4".to_string(),
            title: "Widget".to_string(),
            page: 1,
            price_minor: Some(1999),
            currency: Some("USD".to_string()),
            rating: Some(4.5),
            rating_count: Some(321),
            image_urls: vec![],
        };
        assert!(rec.has_valid_id());
        rec.listing_id = "short".to_string();
        assert!(!rec.has_valid_id());
    }

    #[test]
    fn page_range_json_shape() {
        let r = PageRange::new(1, 150);
        let json = serde_json::to_string(&r).unwrap();
        assert_eq!(json, r#"{"start":1,"end":150}"#);
    }
}
