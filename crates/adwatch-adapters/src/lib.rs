//! Per-source listing extractors: search URL construction + DOM field
//! extraction for each supported marketplace.

use adwatch_core::{Listing, SearchArea, SourceName};
use adwatch_storage::{FetchError, HttpSession, PageArchive};
use async_trait::async_trait;
use chrono::Utc;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::warn;
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "adwatch-adapters";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid search url: {0}")]
    SearchUrl(#[from] url::ParseError),
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
    #[error("{source_name} listing item missing {field}")]
    MissingField {
        source_name: SourceName,
        field: &'static str,
    },
}

/// One marketplace's extraction capability. Adding a source means adding
/// an implementation and a `SourceName` variant; the orchestrator never
/// changes.
#[async_trait]
pub trait ListingExtractor: Send + Sync {
    fn source(&self) -> SourceName;

    /// Source-specific search request for a query within an area.
    fn search_url(&self, area: &SearchArea, query: &str) -> Result<String, ExtractError>;

    /// Extracts raw listing records from a rendered search page.
    fn parse_listings(&self, html: &str) -> Result<Vec<Listing>, ExtractError>;

    /// Fetch, archive, parse. Archive failures are logged, never fatal to
    /// the extraction.
    async fn extract(
        &self,
        session: &HttpSession,
        archive: Option<&PageArchive>,
        run_id: Uuid,
        area: &SearchArea,
        query: &str,
    ) -> Result<Vec<Listing>, ExtractError> {
        let url = self.search_url(area, query)?;
        let body = session.fetch_text(run_id, self.source(), &url).await?;
        if let Some(archive) = archive {
            if let Err(err) = archive
                .store_page(Utc::now(), self.source(), body.as_bytes())
                .await
            {
                warn!(source = %self.source(), error = %err, "failed to archive raw page");
            }
        }
        self.parse_listings(&body)
    }
}

fn parse_selector(selector: &str) -> Result<Selector, ExtractError> {
    Selector::parse(selector).map_err(|e| ExtractError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn child_text(item: ElementRef<'_>, selector: &Selector) -> Option<String> {
    item.select(selector)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn child_attr(item: ElementRef<'_>, selector: &Selector, attr: &str) -> Option<String> {
    item.select(selector)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string()))
}

fn own_attr(item: ElementRef<'_>, attr: &str) -> Option<String> {
    item.value()
        .attr(attr)
        .and_then(|s| text_or_none(s.to_string()))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct KslExtractor;

#[async_trait]
impl ListingExtractor for KslExtractor {
    fn source(&self) -> SourceName {
        SourceName::Ksl
    }

    fn search_url(&self, area: &SearchArea, query: &str) -> Result<String, ExtractError> {
        let url = Url::parse_with_params(
            "https://classifieds.ksl.com/search/",
            &[
                ("keyword", query),
                ("zip", area.zip.as_str()),
                ("miles", &area.miles.to_string()),
                ("priceFrom", ""),
                ("priceTo", ""),
                ("city", ""),
                ("state", ""),
                ("sort", ""),
                ("perPage", "96"),
            ],
        )?;
        Ok(url.into())
    }

    fn parse_listings(&self, html: &str) -> Result<Vec<Listing>, ExtractError> {
        let document = Html::parse_document(html);
        let item_sel = parse_selector(".listing-item")?;
        let title_sel = parse_selector(".item-info-title-link")?;
        let price_sel = parse_selector(".item-info-price.info-line")?;
        let link_sel = parse_selector(".listing-item-link")?;

        let mut listings = Vec::new();
        for item in document.select(&item_sel) {
            let title = child_text(item, &title_sel).ok_or(ExtractError::MissingField {
                source_name: SourceName::Ksl,
                field: "title",
            })?;
            let price = child_text(item, &price_sel).ok_or(ExtractError::MissingField {
                source_name: SourceName::Ksl,
                field: "price",
            })?;
            let url = child_attr(item, &link_sel, "href").ok_or(ExtractError::MissingField {
                source_name: SourceName::Ksl,
                field: "url",
            })?;
            listings.push(Listing { title, price, url });
        }
        Ok(listings)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FacebookMarketplaceExtractor;

#[async_trait]
impl ListingExtractor for FacebookMarketplaceExtractor {
    fn source(&self) -> SourceName {
        SourceName::FacebookMarketplace
    }

    fn search_url(&self, area: &SearchArea, query: &str) -> Result<String, ExtractError> {
        let base = format!(
            "https://www.facebook.com/marketplace/{}/search/",
            area.facebook_marketplace_id
        );
        let url = Url::parse_with_params(
            &base,
            &[
                ("query", query),
                ("latitude", &area.latitude.to_string()),
                ("longitude", &area.longitude.to_string()),
                ("radiusKM", &area.radius_km.to_string()),
                ("vertical", "C2C"),
                ("sort", "CREATION_TIME_DESCEND"),
            ],
        )?;
        Ok(url.into())
    }

    fn parse_listings(&self, html: &str) -> Result<Vec<Listing>, ExtractError> {
        let document = Html::parse_document(html);
        let item_sel = parse_selector(r#"[data-testid="marketplace_feed_item"]"#)?;
        // The feed item carries title/href on itself; the price sits in an
        // unclassed div stack.
        let price_sel = parse_selector("div > div > div > div")?;

        let mut listings = Vec::new();
        for item in document.select(&item_sel) {
            let title = own_attr(item, "title").ok_or(ExtractError::MissingField {
                source_name: SourceName::FacebookMarketplace,
                field: "title",
            })?;
            let price = child_text(item, &price_sel).ok_or(ExtractError::MissingField {
                source_name: SourceName::FacebookMarketplace,
                field: "price",
            })?;
            let url = own_attr(item, "href").ok_or(ExtractError::MissingField {
                source_name: SourceName::FacebookMarketplace,
                field: "url",
            })?;
            listings.push(Listing { title, price, url });
        }
        Ok(listings)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CraigslistExtractor;

#[async_trait]
impl ListingExtractor for CraigslistExtractor {
    fn source(&self) -> SourceName {
        SourceName::Craigslist
    }

    fn search_url(&self, area: &SearchArea, query: &str) -> Result<String, ExtractError> {
        let base = format!("https://{}.craigslist.org/search/sss", area.craigslist_site);
        let url = Url::parse_with_params(
            &base,
            &[
                ("sort", "date"),
                ("postal", area.zip.as_str()),
                ("query", query),
                ("search_distance", &area.miles.to_string()),
            ],
        )?;
        Ok(url.into())
    }

    fn parse_listings(&self, html: &str) -> Result<Vec<Listing>, ExtractError> {
        let document = Html::parse_document(html);
        let item_sel = parse_selector(".result-row")?;
        let title_sel = parse_selector("a.result-title")?;
        let price_sel = parse_selector(".result-price")?;

        let mut listings = Vec::new();
        for item in document.select(&item_sel) {
            let title = child_text(item, &title_sel).ok_or(ExtractError::MissingField {
                source_name: SourceName::Craigslist,
                field: "title",
            })?;
            let price = child_text(item, &price_sel).ok_or(ExtractError::MissingField {
                source_name: SourceName::Craigslist,
                field: "price",
            })?;
            let url = child_attr(item, &title_sel, "href").ok_or(ExtractError::MissingField {
                source_name: SourceName::Craigslist,
                field: "url",
            })?;
            listings.push(Listing { title, price, url });
        }
        Ok(listings)
    }
}

pub fn extractor_for_source(source: SourceName) -> Box<dyn ListingExtractor> {
    match source {
        SourceName::Ksl => Box::new(KslExtractor),
        SourceName::FacebookMarketplace => Box::new(FacebookMarketplaceExtractor),
        SourceName::Craigslist => Box::new(CraigslistExtractor),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KSL_PAGE: &str = r#"
        <html><body>
          <div class="listing-item">
            <a class="item-info-title-link">Super Nintendo Console</a>
            <div class="item-info-price info-line">$80</div>
            <a class="listing-item-link" href="https://classifieds.ksl.com/listing/1">view</a>
          </div>
          <div class="listing-item">
            <a class="item-info-title-link">SNES Games Lot</a>
            <div class="item-info-price info-line">$45</div>
            <a class="listing-item-link" href="https://classifieds.ksl.com/listing/2">view</a>
          </div>
        </body></html>"#;

    const FACEBOOK_PAGE: &str = r#"
        <html><body>
          <a data-testid="marketplace_feed_item" title="SNES Classic" href="https://facebook.com/item/9">
            <div><div><div><div>$60</div></div></div></div>
          </a>
        </body></html>"#;

    const CRAIGSLIST_PAGE: &str = r#"
        <html><body>
          <li class="result-row">
            <a class="result-title" href="https://saltlakecity.craigslist.org/1.html">SNES bundle</a>
            <span class="result-price">$70</span>
          </li>
        </body></html>"#;

    #[test]
    fn ksl_page_parses_in_document_order() {
        let listings = KslExtractor.parse_listings(KSL_PAGE).expect("parse");
        assert_eq!(listings.len(), 2);
        assert_eq!(listings[0].title, "Super Nintendo Console");
        assert_eq!(listings[0].price, "$80");
        assert_eq!(listings[0].url, "https://classifieds.ksl.com/listing/1");
        assert_eq!(listings[1].url, "https://classifieds.ksl.com/listing/2");
    }

    #[test]
    fn facebook_page_reads_title_and_href_from_the_item() {
        let listings = FacebookMarketplaceExtractor
            .parse_listings(FACEBOOK_PAGE)
            .expect("parse");
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].title, "SNES Classic");
        assert_eq!(listings[0].price, "$60");
        assert_eq!(listings[0].url, "https://facebook.com/item/9");
    }

    #[test]
    fn craigslist_page_reads_url_from_the_title_anchor() {
        let listings = CraigslistExtractor
            .parse_listings(CRAIGSLIST_PAGE)
            .expect("parse");
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].title, "SNES bundle");
        assert_eq!(listings[0].price, "$70");
        assert_eq!(
            listings[0].url,
            "https://saltlakecity.craigslist.org/1.html"
        );
    }

    #[test]
    fn missing_item_field_is_an_extraction_error() {
        let page = r#"
            <div class="listing-item">
              <a class="item-info-title-link">No price here</a>
              <a class="listing-item-link" href="https://classifieds.ksl.com/listing/3">view</a>
            </div>"#;
        let err = KslExtractor.parse_listings(page).unwrap_err();
        assert!(matches!(
            err,
            ExtractError::MissingField {
                source_name: SourceName::Ksl,
                field: "price"
            }
        ));
    }

    #[test]
    fn page_without_items_is_empty_not_an_error() {
        let listings = KslExtractor
            .parse_listings("<html><body>no results</body></html>")
            .expect("parse");
        assert!(listings.is_empty());
    }

    #[test]
    fn search_urls_encode_the_query() {
        let area = SearchArea::default();
        let ksl = KslExtractor.search_url(&area, "Super Nintendo").expect("url");
        assert!(ksl.starts_with("https://classifieds.ksl.com/search/?"));
        assert!(ksl.contains("keyword=Super+Nintendo"));
        assert!(ksl.contains("zip=84093"));
        assert!(ksl.contains("perPage=96"));

        let craigslist = CraigslistExtractor
            .search_url(&area, "Super Nintendo")
            .expect("url");
        assert!(craigslist.starts_with("https://saltlakecity.craigslist.org/search/sss?"));
        assert!(craigslist.contains("query=Super+Nintendo"));
        assert!(craigslist.contains("search_distance=60"));

        let facebook = FacebookMarketplaceExtractor
            .search_url(&area, "Super Nintendo")
            .expect("url");
        assert!(facebook
            .starts_with("https://www.facebook.com/marketplace/105496622817769/search/?"));
        assert!(facebook.contains("sort=CREATION_TIME_DESCEND"));
    }

    #[test]
    fn registry_covers_every_source() {
        for source in SourceName::ALL {
            assert_eq!(extractor_for_source(source).source(), source);
        }
    }
}
