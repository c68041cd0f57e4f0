use insight_core::config::ScraperConfig;
use insight_core::error::AppError;
use insight_core::models::{InsightRecord, InsightSource, compute_hash, insight_id};
use insight_core::traits::InsightParser;
use rand::Rng;
use scraper::{ElementRef, Html, Selector};
use url::Url;

const ENTRY: &str = ".gecko-timeline-entry";
const CONTENT: &str = ".gecko-timeline-entry-content";
const TITLE: &str = ".gecko-insight .tw-font-semibold";
const BODY: &str = ".gecko-insight .tw-font-normal";
const SOURCE_COUNT: &str = ".tw-text-xs.tw-leading-4";
const LINKS: &str = "a[href*='http']";
const SOURCE_LINKS: &str = ".gecko-insight-sources a, .insight-source a, [class*='source'] a";

#[derive(Debug, Clone)]
struct Selectors {
    entry: Selector,
    content: Selector,
    title: Selector,
    body: Selector,
    source_count: Selector,
    links: Selector,
    source_links: Selector,
}

impl Selectors {
    fn compile() -> Result<Self, AppError> {
        let parse = |css: &str| {
            Selector::parse(css)
                .map_err(|e| AppError::ParseError(format!("Invalid selector '{css}': {e}")))
        };
        Ok(Self {
            entry: parse(ENTRY)?,
            content: parse(CONTENT)?,
            title: parse(TITLE)?,
            body: parse(BODY)?,
            source_count: parse(SOURCE_COUNT)?,
            links: parse(LINKS)?,
            source_links: parse(SOURCE_LINKS)?,
        })
    }
}

/// Extracts insight records from the markup of a CoinGecko insight page.
///
/// Each `.gecko-timeline-entry` becomes one record. Entries are parsed in
/// isolation: a malformed entry is logged and skipped.
///
/// # Example
///
/// ```rust
/// use insight_client::GeckoInsightExtractor;
/// use insight_core::traits::InsightParser;
///
/// let extractor = GeckoInsightExtractor::new("coingecko.com").unwrap();
/// let markup = r#"<div class="gecko-timeline-entry" data-url="/insights/42">
///   <div class="gecko-timeline-entry-content">
///     <div class="gecko-insight">
///       <span class="tw-font-semibold">Upgrade:</span>
///       <span class="tw-font-normal">Mainnet fork scheduled</span>
///     </div>
///   </div>
/// </div>"#;
/// let records = extractor.parse("btc", markup, 1_700_000_000);
/// assert_eq!(records[0].id, "btc_42");
/// assert_eq!(records[0].title, "Upgrade");
/// ```
#[derive(Debug, Clone)]
pub struct GeckoInsightExtractor {
    selectors: Selectors,
    origin_host: String,
    title_limit: usize,
    stable_fallback_ids: bool,
}

impl GeckoInsightExtractor {
    /// Extractor excluding links to `origin_host`, with a 200 character
    /// source-title limit and random fallback ids.
    pub fn new(origin_host: &str) -> Result<Self, AppError> {
        Ok(Self {
            selectors: Selectors::compile()?,
            origin_host: origin_host.to_lowercase(),
            title_limit: 200,
            stable_fallback_ids: false,
        })
    }

    pub fn from_config(config: &ScraperConfig) -> Result<Self, AppError> {
        Ok(Self::new(config.site.origin_host())?
            .with_title_limit(config.source_title_limit)
            .with_stable_fallback_ids(config.stable_fallback_ids))
    }

    pub fn with_title_limit(mut self, limit: usize) -> Self {
        self.title_limit = limit;
        self
    }

    /// Derive ids for entries without a `data-url` from their content
    /// instead of a random number, so re-scrapes hit the same record.
    pub fn with_stable_fallback_ids(mut self, enabled: bool) -> Self {
        self.stable_fallback_ids = enabled;
        self
    }

    fn parse_entry(
        &self,
        token_id: &str,
        entry: ElementRef<'_>,
        timestamp: i64,
    ) -> Result<InsightRecord, AppError> {
        let content = entry
            .select(&self.selectors.content)
            .next()
            .ok_or_else(|| AppError::ParseError("entry has no content block".into()))?;

        let title = content
            .select(&self.selectors.title)
            .next()
            .map(|el| element_text(&el).trim_end_matches(':').trim_end().to_string())
            .unwrap_or_default();
        let body = content
            .select(&self.selectors.body)
            .next()
            .map(|el| element_text(&el))
            .unwrap_or_default();
        let source_count = content
            .select(&self.selectors.source_count)
            .next()
            .and_then(|el| {
                element_text(&el)
                    .split_whitespace()
                    .next()
                    .and_then(|n| n.parse::<i32>().ok())
            })
            .unwrap_or(0);

        let entry_id = match entry
            .value()
            .attr("data-url")
            .and_then(|u| u.rsplit('/').next())
            .filter(|id| !id.is_empty())
        {
            Some(id) => id.to_string(),
            None => self.fallback_id(token_id, timestamp, &title, &body),
        };

        Ok(InsightRecord {
            id: insight_id(token_id, &entry_id),
            token_id: token_id.to_string(),
            timestamp,
            title,
            content: body,
            source_count,
            sources: self.collect_sources(entry),
        })
    }

    fn fallback_id(&self, token_id: &str, timestamp: i64, title: &str, body: &str) -> String {
        if self.stable_fallback_ids {
            let hash = compute_hash(&format!("{title}\n{body}"));
            return format!("gen_{timestamp}_{}", &hash[..16]);
        }
        let n: u32 = rand::rng().random_range(1000..=9999);
        tracing::warn!(token = %token_id, timestamp, "Entry has no data-url, using a random id");
        format!("gen_{timestamp}_{n}")
    }

    /// Outbound links of an entry, first occurrence of each URL wins.
    fn collect_sources(&self, entry: ElementRef<'_>) -> Vec<InsightSource> {
        let mut sources: Vec<InsightSource> = Vec::new();

        for link in entry.select(&self.selectors.links) {
            let href = link.value().attr("href").unwrap_or_default();
            let text = element_text(&link);
            if href.is_empty() || text.is_empty() {
                continue;
            }
            self.push_source(&mut sources, href, &text);
        }

        for link in entry.select(&self.selectors.source_links) {
            let href = link.value().attr("href").unwrap_or_default();
            if href.is_empty() {
                continue;
            }
            self.push_source(&mut sources, href, &element_text(&link));
        }

        sources
    }

    fn push_source(&self, sources: &mut Vec<InsightSource>, href: &str, text: &str) {
        if self.is_origin_link(href) || sources.iter().any(|s| s.url == href) {
            return;
        }
        sources.push(InsightSource {
            url: href.to_string(),
            title: text.chars().take(self.title_limit).collect(),
        });
    }

    fn is_origin_link(&self, href: &str) -> bool {
        match Url::parse(href) {
            Ok(url) => url.host_str().is_some_and(|host| {
                let host = host.to_lowercase();
                host == self.origin_host || host.ends_with(&format!(".{}", self.origin_host))
            }),
            Err(_) => href.to_lowercase().contains(&self.origin_host),
        }
    }
}

impl InsightParser for GeckoInsightExtractor {
    fn parse(&self, token_id: &str, markup: &str, timestamp: i64) -> Vec<InsightRecord> {
        if markup.trim().is_empty() {
            return Vec::new();
        }

        let document = Html::parse_fragment(markup);
        let mut records = Vec::new();
        for entry in document.select(&self.selectors.entry) {
            match self.parse_entry(token_id, entry, timestamp) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(token = %token_id, error = %e, "Skipping insight entry"),
            }
        }
        records
    }
}

/// Text of an element with each text node trimmed, joined by single spaces.
fn element_text(el: &ElementRef<'_>) -> String {
    el.text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> GeckoInsightExtractor {
        GeckoInsightExtractor::new("coingecko.com").unwrap()
    }

    fn entry(attrs: &str, inner: &str) -> String {
        format!(r#"<div class="gecko-timeline-entry" {attrs}>{inner}</div>"#)
    }

    const FULL_CONTENT: &str = r#"
        <div class="gecko-timeline-entry-content">
          <div class="gecko-insight">
            <span class="tw-font-semibold">Foo:</span>
            <span class="tw-font-normal">Bar</span>
          </div>
          <div class="tw-text-xs tw-leading-4">3 sources</div>
          <a href="https://news.example.com/a">Example article</a>
        </div>"#;

    #[test]
    fn parses_a_complete_entry() {
        let markup = entry(r#"data-url="/en/coins/btc/insights/12345""#, FULL_CONTENT);
        let records = extractor().parse("btc", &markup, 100);

        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.id, "btc_12345");
        assert_eq!(record.token_id, "btc");
        assert_eq!(record.timestamp, 100);
        assert_eq!(record.title, "Foo");
        assert_eq!(record.content, "Bar");
        assert_eq!(record.source_count, 3);
        assert_eq!(
            record.sources,
            vec![InsightSource {
                url: "https://news.example.com/a".into(),
                title: "Example article".into(),
            }]
        );
    }

    #[test]
    fn empty_markup_yields_nothing() {
        assert!(extractor().parse("btc", "", 1).is_empty());
        assert!(extractor().parse("btc", "<p>no entries</p>", 1).is_empty());
    }

    #[test]
    fn entry_without_content_block_is_skipped_alone() {
        let markup = format!(
            "{}{}",
            entry(r#"data-url="/x/1""#, "<div>broken</div>"),
            entry(r#"data-url="/x/2""#, FULL_CONTENT),
        );
        let records = extractor().parse("eth", &markup, 5);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "eth_2");
    }

    #[test]
    fn missing_fields_default() {
        let markup = entry(
            r#"data-url="/x/9""#,
            r#"<div class="gecko-timeline-entry-content">
                 <div class="tw-text-xs tw-leading-4">many sources</div>
               </div>"#,
        );
        let record = &extractor().parse("btc", &markup, 1)[0];
        assert_eq!(record.title, "");
        assert_eq!(record.content, "");
        assert_eq!(record.source_count, 0);
        assert!(record.sources.is_empty());
    }

    #[test]
    fn missing_data_url_synthesizes_random_id() {
        let markup = entry("", FULL_CONTENT);
        let record = &extractor().parse("btc", &markup, 777)[0];
        let suffix = record.id.strip_prefix("btc_gen_777_").unwrap();
        let n: u32 = suffix.parse().unwrap();
        assert!((1000..=9999).contains(&n));
    }

    #[test]
    fn stable_fallback_ids_repeat_across_parses() {
        let extractor = extractor().with_stable_fallback_ids(true);
        let markup = entry("", FULL_CONTENT);
        let first = extractor.parse("btc", &markup, 777);
        let second = extractor.parse("btc", &markup, 777);
        assert_eq!(first[0].id, second[0].id);
        assert_eq!(first[0].id.len(), "btc_gen_777_".len() + 16);
    }

    #[test]
    fn sources_exclude_origin_and_deduplicate() {
        let content = r#"
            <div class="gecko-timeline-entry-content">
              <a href="https://www.coingecko.com/en/coins/btc">CoinGecko</a>
              <a href="https://news.example.com/a">First title</a>
              <a href="https://news.example.com/a">Duplicate</a>
              <a href="https://empty.example.com/"></a>
              <div class="insight-source">
                <a href="https://news.example.com/a">Again</a>
                <a href="https://other.example.org/b"></a>
              </div>
            </div>"#;
        let markup = entry(r#"data-url="/x/1""#, content);
        let sources = &extractor().parse("btc", &markup, 1)[0].sources;

        let urls: Vec<_> = sources.iter().map(|s| s.url.as_str()).collect();
        assert_eq!(
            urls,
            vec!["https://news.example.com/a", "https://other.example.org/b"]
        );
        assert_eq!(sources[0].title, "First title");
        assert_eq!(sources[1].title, "");
    }

    #[test]
    fn source_titles_are_truncated() {
        let long = "x".repeat(300);
        let content = format!(
            r#"<div class="gecko-timeline-entry-content"><a href="https://a.example/">{long}</a></div>"#
        );
        let markup = entry(r#"data-url="/x/1""#, &content);
        let sources = &extractor().parse("btc", &markup, 1)[0].sources;
        assert_eq!(sources[0].title.chars().count(), 200);

        let short = extractor().with_title_limit(10);
        assert_eq!(short.parse("btc", &markup, 1)[0].sources[0].title.len(), 10);
    }

    #[test]
    fn entries_do_not_leak_links_into_each_other() {
        let a = entry(
            r#"data-url="/x/a""#,
            r#"<div class="gecko-timeline-entry-content"><a href="https://a.example/">A</a></div>"#,
        );
        let b = entry(
            r#"data-url="/x/b""#,
            r#"<div class="gecko-timeline-entry-content"><a href="https://b.example/">B</a></div>"#,
        );
        let records = extractor().parse("sol", &format!("{a}{b}"), 1);
        assert_eq!(records[0].sources.len(), 1);
        assert_eq!(records[0].sources[0].url, "https://a.example/");
        assert_eq!(records[1].sources[0].url, "https://b.example/");
    }

    #[test]
    fn from_config_uses_site_host() {
        let extractor = GeckoInsightExtractor::from_config(&ScraperConfig::default()).unwrap();
        let markup = entry(
            r#"data-url="/x/1""#,
            r#"<div class="gecko-timeline-entry-content">
                 <a href="https://coingecko.com/internal">Internal</a>
               </div>"#,
        );
        assert!(extractor.parse("btc", &markup, 1)[0].sources.is_empty());
    }
}
