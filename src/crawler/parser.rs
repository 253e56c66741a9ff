//! HTML extractor driven by per-site selectors
//!
//! This module provides `HtmlExtractor`, the `Extractor` used by the CLI:
//! - Listing pages: links from elements matching the site's `link-selector`
//! - Detail pages: one text value per configured field selector

use crate::config::SiteConfig;
use crate::crawler::StructuredResult;
use crate::output::{Extractor, Page};
use crate::ExtractError;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use url::Url;

/// Selector-based `Extractor` built on `scraper`
#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlExtractor;

impl HtmlExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl Extractor for HtmlExtractor {
    /// Extracts detail links from a listing page
    ///
    /// # Link Extraction Rules
    ///
    /// - Each element matched by `link-selector` contributes its own `href`,
    ///   or the first `a[href]` inside it
    /// - Relative links are resolved against the page URL
    /// - `javascript:`, `mailto:`, `tel:`, `data:` and fragment-only links are skipped
    /// - Duplicates are dropped, keeping discovery order
    fn extract_links(&self, site: &SiteConfig, page: &Page) -> Result<Vec<String>, ExtractError> {
        let base_url = Url::parse(&page.url)
            .map_err(|e| ExtractError::Parse(format!("bad page URL {}: {}", page.url, e)))?;
        let link_selector = parse_selector(&site.link_selector)?;
        let anchor_selector = parse_selector("a[href]")?;

        let document = Html::parse_document(&page.body);
        let mut seen = HashSet::new();
        let mut links = Vec::new();

        for element in document.select(&link_selector) {
            let href = element.value().attr("href").or_else(|| {
                element
                    .select(&anchor_selector)
                    .next()
                    .and_then(|a| a.value().attr("href"))
            });

            if let Some(absolute_url) = href.and_then(|h| resolve_link(h, &base_url)) {
                if seen.insert(absolute_url.clone()) {
                    links.push(absolute_url);
                }
            }
        }

        Ok(links)
    }

    /// Extracts one result with a text value per matched field
    ///
    /// Fields whose selector matches nothing are left out. If no field
    /// matches at all the page is reported as a `SelectorMiss`.
    fn extract_detail(
        &self,
        site: &SiteConfig,
        page: &Page,
    ) -> Result<Option<StructuredResult>, ExtractError> {
        if page.body.trim().is_empty() {
            return Err(ExtractError::InvalidMarkup(format!(
                "empty document at {}",
                page.url
            )));
        }

        let document = Html::parse_document(&page.body);
        let mut fields = serde_json::Map::new();

        for (name, selector) in &site.fields {
            let selector = parse_selector(selector)?;
            if let Some(text) = document.select(&selector).next().map(element_text) {
                if !text.is_empty() {
                    fields.insert(name.clone(), serde_json::Value::String(text));
                }
            }
        }

        if fields.is_empty() {
            return Err(ExtractError::SelectorMiss(format!(
                "no field selector matched on {}",
                page.url
            )));
        }

        Ok(Some(StructuredResult::new(&site.id, &page.url, fields)))
    }
}

fn parse_selector(selector: &str) -> Result<Selector, ExtractError> {
    Selector::parse(selector)
        .map_err(|e| ExtractError::Parse(format!("invalid selector '{}': {}", selector, e)))
}

/// Collapses an element's text into single-spaced, trimmed form
fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Resolves a link href to an absolute URL and validates it
///
/// Returns None if the link should be excluded:
/// - javascript:, mailto:, tel: schemes
/// - data: URIs
/// - Invalid URLs
/// - Non-HTTP(S) URLs after resolution
fn resolve_link(href: &str, base_url: &Url) -> Option<String> {
    let href = href.trim();

    if href.is_empty() || href.starts_with('#') {
        return None;
    }

    if href.starts_with("javascript:")
        || href.starts_with("mailto:")
        || href.starts_with("tel:")
        || href.starts_with("data:")
    {
        return None;
    }

    let mut absolute_url = base_url.join(href).ok()?;
    if absolute_url.scheme() != "http" && absolute_url.scheme() != "https" {
        return None;
    }
    absolute_url.set_fragment(None);
    Some(absolute_url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn site() -> SiteConfig {
        let mut fields = BTreeMap::new();
        fields.insert("title".to_string(), "h1".to_string());
        fields.insert("price".to_string(), ".price".to_string());
        SiteConfig {
            id: "a".to_string(),
            name: None,
            search_url: "https://example.com/search?q={query}".to_string(),
            link_selector: "a.result".to_string(),
            fields,
            max_detail_links: None,
        }
    }

    fn page(body: &str) -> Page {
        Page {
            url: "https://example.com/search?q=lamp".to_string(),
            status_code: 200,
            body: body.to_string(),
        }
    }

    #[test]
    fn test_extract_relative_and_absolute_links() {
        let html = r#"
            <a class="result" href="/item/1">One</a>
            <a class="result" href="https://other.com/item/2">Two</a>
            <a href="/about">Not a result</a>
        "#;
        let links = HtmlExtractor.extract_links(&site(), &page(html)).unwrap();
        assert_eq!(
            links,
            vec!["https://example.com/item/1", "https://other.com/item/2"]
        );
    }

    #[test]
    fn test_links_deduplicated_in_discovery_order() {
        let html = r#"
            <a class="result" href="/item/2">Two</a>
            <a class="result" href="/item/1">One</a>
            <a class="result" href="/item/2#reviews">Two again</a>
        "#;
        let links = HtmlExtractor.extract_links(&site(), &page(html)).unwrap();
        assert_eq!(
            links,
            vec!["https://example.com/item/2", "https://example.com/item/1"]
        );
    }

    #[test]
    fn test_container_selector_uses_inner_anchor() {
        let mut site = site();
        site.link_selector = "li.card".to_string();
        let html = r#"<ul><li class="card"><span>x</span><a href="item/9">Nine</a></li></ul>"#;
        let links = HtmlExtractor.extract_links(&site, &page(html)).unwrap();
        assert_eq!(links, vec!["https://example.com/item/9"]);
    }

    #[test]
    fn test_skip_special_schemes() {
        let html = r##"
            <a class="result" href="javascript:void(0)">js</a>
            <a class="result" href="mailto:a@example.com">mail</a>
            <a class="result" href="tel:+123">tel</a>
            <a class="result" href="data:text/html,hi">data</a>
            <a class="result" href="#top">top</a>
        "##;
        let links = HtmlExtractor.extract_links(&site(), &page(html)).unwrap();
        assert!(links.is_empty());
    }

    #[test]
    fn test_invalid_selector_is_parse_error() {
        let mut site = site();
        site.link_selector = "a[".to_string();
        let err = HtmlExtractor.extract_links(&site, &page("<a></a>")).unwrap_err();
        assert!(matches!(err, ExtractError::Parse(_)));
    }

    #[test]
    fn test_extract_detail() {
        let html = r#"<h1>  Brass   desk lamp </h1><span class="price">$40</span>"#;
        let result = HtmlExtractor
            .extract_detail(&site(), &page(html))
            .unwrap()
            .unwrap();
        assert_eq!(result.site_id, "a");
        assert_eq!(result.fields["title"], "Brass desk lamp");
        assert_eq!(result.fields["price"], "$40");
    }

    #[test]
    fn test_partial_detail_is_kept() {
        let html = r#"<h1>Lamp</h1>"#;
        let result = HtmlExtractor
            .extract_detail(&site(), &page(html))
            .unwrap()
            .unwrap();
        assert_eq!(result.fields.len(), 1);
    }

    #[test]
    fn test_detail_selector_miss() {
        let err = HtmlExtractor
            .extract_detail(&site(), &page("<p>nothing here</p>"))
            .unwrap_err();
        assert!(matches!(err, ExtractError::SelectorMiss(_)));
    }

    #[test]
    fn test_empty_detail_is_invalid_markup() {
        let err = HtmlExtractor
            .extract_detail(&site(), &page("   "))
            .unwrap_err();
        assert!(matches!(err, ExtractError::InvalidMarkup(_)));
    }
}
