//! Selector-driven extraction of listing records from fetched HTML.
//!
//! Selectors are configuration, not code, so a markup change on the target
//! site stays a config edit. Price, rating and pagination text are parsed
//! leniently; a field that does not parse becomes `None` rather than
//! failing the whole record.

use scraper::{ElementRef, Html, Selector};
use thiserror::Error;

use crate::models::ListingRecord;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("invalid selector `{0}`")]
    BadSelector(String),
    #[error("page carries no pagination strip")]
    NoPagination,
}

/// CSS selectors describing the listing markup.
#[derive(Debug, Clone)]
pub struct ListingSelectors {
    /// One element per listing item; must carry the id attribute.
    pub item: String,
    /// Attribute on the item element holding the 10-char identifier.
    pub id_attr: String,
    pub link: String,
    pub title: String,
    pub price: String,
    pub rating: String,
    pub rating_count: String,
    pub image: String,
    /// Numbered links of the pagination strip; the max is `totalPages`.
    pub pagination_page: String,
    /// Element whose text contains the total result count.
    pub results_count: String,
}

impl Default for ListingSelectors {
    fn default() -> Self {
        Self {
            item: "div[data-listing-id]".to_string(),
            id_attr: "data-listing-id".to_string(),
            link: "a.item-link".to_string(),
            title: ".item-title".to_string(),
            price: ".price".to_string(),
            rating: ".rating".to_string(),
            rating_count: ".rating-count".to_string(),
            image: "img".to_string(),
            pagination_page: ".pagination .page-num".to_string(),
            results_count: ".results-count".to_string(),
        }
    }
}

fn selector(css: &str) -> Result<Selector, ExtractError> {
    Selector::parse(css).map_err(|_| ExtractError::BadSelector(css.to_string()))
}

fn text_of(el: &ElementRef<'_>) -> String {
    el.text().collect::<String>().trim().to_string()
}

/// Parse a price fragment like `$1,234.56` or `EUR 12.30` into minor units
/// plus a currency code.
pub fn parse_price(raw: &str) -> (Option<i64>, Option<String>) {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return (None, None);
    }

    let currency = if trimmed.contains('$') {
        Some("USD")
    } else if trimmed.contains('€') {
        Some("EUR")
    } else if trimmed.contains('£') {
        Some("GBP")
    } else if trimmed.contains('¥') {
        Some("JPY")
    } else {
        trimmed
            .split_whitespace()
            .find(|w| w.len() == 3 && w.chars().all(|c| c.is_ascii_uppercase()))
    };

    let numeric: String = trimmed
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    if numeric.is_empty() {
        return (None, currency.map(str::to_string));
    }

    let minor = match numeric.split_once('.') {
        Some((whole, frac)) => {
            let whole: i64 = whole.parse().unwrap_or(0);
            let cents: i64 = format!("{:0<2}", &frac[..frac.len().min(2)])
                .parse()
                .unwrap_or(0);
            whole * 100 + cents
        }
        None => numeric.parse::<i64>().map(|n| n * 100).unwrap_or(0),
    };

    (Some(minor), currency.map(str::to_string))
}

/// Leading float of a rating fragment like `4.5 out of 5 stars`.
pub fn parse_rating(raw: &str) -> Option<f64> {
    let lead: String = raw
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    lead.parse::<f64>().ok().filter(|r| (0.0..=5.0).contains(r))
}

/// First integer in a fragment like `1,204 ratings`, commas stripped.
fn parse_count(raw: &str) -> Option<i64> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Largest integer found in a text blob, commas stripped. Used for result
/// counts rendered as `1-24 of 7,204 results`.
fn largest_number(raw: &str) -> Option<u64> {
    let cleaned = raw.replace(',', "");
    let mut best: Option<u64> = None;
    let mut current = String::new();
    for c in cleaned.chars().chain(std::iter::once(' ')) {
        if c.is_ascii_digit() {
            current.push(c);
        } else if !current.is_empty() {
            if let Ok(n) = current.parse::<u64>() {
                best = Some(best.map_or(n, |b| b.max(n)));
            }
            current.clear();
        }
    }
    best
}

/// Extract all records from one listing page.
pub fn extract_listing(
    html: &str,
    page: u64,
    selectors: &ListingSelectors,
) -> Result<Vec<ListingRecord>, ExtractError> {
    let doc = Html::parse_document(html);
    let item_sel = selector(&selectors.item)?;
    let link_sel = selector(&selectors.link)?;
    let title_sel = selector(&selectors.title)?;
    let price_sel = selector(&selectors.price)?;
    let rating_sel = selector(&selectors.rating)?;
    let rating_count_sel = selector(&selectors.rating_count)?;
    let image_sel = selector(&selectors.image)?;

    let mut records = Vec::new();
    for item in doc.select(&item_sel) {
        let Some(listing_id) = item.value().attr(&selectors.id_attr) else {
            continue;
        };

        let url = item
            .select(&link_sel)
            .next()
            .and_then(|a| a.value().attr("href"))
            .unwrap_or_default()
            .to_string();
        let title = item
            .select(&title_sel)
            .next()
            .map(|t| text_of(&t))
            .unwrap_or_default();

        let (price_minor, currency) = item
            .select(&price_sel)
            .next()
            .map(|p| parse_price(&text_of(&p)))
            .unwrap_or((None, None));

        let rating = item
            .select(&rating_sel)
            .next()
            .and_then(|r| parse_rating(&text_of(&r)));
        let rating_count = item
            .select(&rating_count_sel)
            .next()
            .and_then(|r| parse_count(&text_of(&r)));

        let image_urls: Vec<String> = item
            .select(&image_sel)
            .filter_map(|img| img.value().attr("src"))
            .map(str::to_string)
            .collect();

        records.push(ListingRecord {
            listing_id: listing_id.to_string(),
            url,
            title,
            page,
            price_minor,
            currency,
            rating,
            rating_count,
            image_urls,
        });
    }

    Ok(records)
}

/// Read `(totalPages, totalProducts)` off the first listing page.
///
/// `totalPages` is the largest numbered pagination link; a page with items
/// but no strip counts as a single page. `totalProducts` comes from the
/// results-count blurb and falls back to 0 when the site hides it.
pub fn extract_totals(
    html: &str,
    selectors: &ListingSelectors,
) -> Result<(u64, u64), ExtractError> {
    let doc = Html::parse_document(html);

    let page_sel = selector(&selectors.pagination_page)?;
    let total_pages = doc
        .select(&page_sel)
        .filter_map(|el| largest_number(&text_of(&el)))
        .max();

    let count_sel = selector(&selectors.results_count)?;
    let total_products = doc
        .select(&count_sel)
        .next()
        .and_then(|el| largest_number(&text_of(&el)))
        .unwrap_or(0);

    match total_pages {
        Some(pages) => Ok((pages, total_products)),
        None => {
            let item_sel = selector(&selectors.item)?;
            if doc.select(&item_sel).next().is_some() {
                Ok((1, total_products))
            } else {
                Err(ExtractError::NoPagination)
            }
        }
    }
}

/// Whether `css` matches anything in the document. Backs the signed-in probe.
pub fn has_match(html: &str, css: &str) -> Result<bool, ExtractError> {
    let doc = Html::parse_document(html);
    let sel = selector(css)?;
    Ok(doc.select(&sel).next().is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING_HTML: &str = r##"
        <html><body>
          <div class="results-count">1-24 of 7,204 results</div>
          <div data-listing-id="B0A1B2C3D4">
            <a class="item-link" href="https://shop.example.com/item/B0A1B2C3D4">x</a>
            <span class="item-title">USB-C Hub, 7 ports</span>
            <span class="price">$39.99</span>
            <span class="rating">4.6 out of 5 stars</span>
            <span class="rating-count">1,204</span>
            <img src="https://img.example.com/1.jpg"/>
            <img src="https://img.example.com/2.jpg"/>
          </div>
          <div data-listing-id="C9X8Y7Z6W5">
            <a class="item-link" href="https://shop.example.com/item/C9X8Y7Z6W5">x</a>
            <span class="item-title">Mechanical Keyboard</span>
            <span class="price">€89.00</span>
          </div>
          <div class="pagination">
            <a class="page-num">1</a>
            <a class="page-num">2</a>
            <a class="page-num">300</a>
          </div>
        </body></html>
    "##;

    #[test]
    fn extracts_records_with_optional_fields() {
        let records = extract_listing(LISTING_HTML, 3, &ListingSelectors::default()).unwrap();
        assert_eq!(records.len(), 2);

        let first = &records[0];
        assert_eq!(first.listing_id, "B0A1B2C3D4");
        assert_eq!(first.page, 3);
        assert_eq!(first.title, "USB-C Hub, 7 ports");
        assert_eq!(first.price_minor, Some(3999));
        assert_eq!(first.currency.as_deref(), Some("USD"));
        assert_eq!(first.rating, Some(4.6));
        assert_eq!(first.rating_count, Some(1204));
        assert_eq!(first.image_urls.len(), 2);

        let second = &records[1];
        assert_eq!(second.price_minor, Some(8900));
        assert_eq!(second.currency.as_deref(), Some("EUR"));
        assert_eq!(second.rating, None);
    }

    #[test]
    fn totals_from_pagination_and_result_count() {
        let (pages, products) =
            extract_totals(LISTING_HTML, &ListingSelectors::default()).unwrap();
        assert_eq!(pages, 300);
        assert_eq!(products, 7204);
    }

    #[test]
    fn single_page_listing_without_strip() {
        let html = r#"<div data-listing-id="A000000001"><span class="item-title">t</span></div>"#;
        let (pages, products) = extract_totals(html, &ListingSelectors::default()).unwrap();
        assert_eq!(pages, 1);
        assert_eq!(products, 0);
    }

    #[test]
    fn empty_page_has_no_pagination() {
        let err = extract_totals("<html></html>", &ListingSelectors::default()).unwrap_err();
        assert!(matches!(err, ExtractError::NoPagination));
    }

    #[test]
    fn price_parsing_variants() {
        assert_eq!(parse_price("$1,234.56"), (Some(123456), Some("USD".into())));
        assert_eq!(parse_price("£5"), (Some(500), Some("GBP".into())));
        assert_eq!(parse_price("12.30 CAD"), (Some(1230), Some("CAD".into())));
        assert_eq!(parse_price(""), (None, None));
    }

    #[test]
    fn rating_parsing() {
        assert_eq!(parse_rating("4.5 out of 5 stars"), Some(4.5));
        assert_eq!(parse_rating("not rated"), None);
        assert_eq!(parse_rating("9.9"), None);
    }

    #[test]
    fn signed_in_probe() {
        let html = r#"<div data-account-name="jane"></div>"#;
        assert!(has_match(html, "[data-account-name]").unwrap());
        assert!(!has_match("<div></div>", "[data-account-name]").unwrap());
    }
}
