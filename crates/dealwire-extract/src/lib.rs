//! Per-source extractors: heuristic HTML, RSS/Atom, CSS-selector, affiliate
//! API, and free-text coupon patterns.

use std::collections::HashSet;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use dealwire_core::{AliasTable, MatchTokens, RawCandidate, SourceKind};
use dealwire_store::{FetchError, HttpFetcher};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "dealwire-extract";

/// Extractor base confidence. Structured sources outrank heuristic ones; the
/// normalizer adds flat boosts on top, never renormalizing.
pub const SCORE_API: f64 = 0.9;
pub const SCORE_CSS: f64 = 0.9;
pub const SCORE_PROMO_BLOCK: f64 = 0.85;
pub const SCORE_PROMO_LINK: f64 = 0.8;
pub const SCORE_RSS: f64 = 0.7;
pub const SCORE_TEXT_PATTERN: f64 = 0.65;

const ANCHOR_SCAN_CAP: usize = 2000;
const STYLED_SCAN_CAP: usize = 2000;
const FEED_ENTRY_CAP: usize = 200;
const CSS_ITEM_CAP: usize = 200;

const PROMO_BLOCK_MIN_CHARS: usize = 8;
const PROMO_BLOCK_MAX_CHARS: usize = 300;
const MIN_ANCHOR_TITLE_CHARS: usize = 12;
const NEARBY_CONTEXT_MAX_CHARS: usize = 200;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("parse failure: {0}")]
    Parse(String),
}

/// CSS selector set for `html_css` sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CssSelectors {
    pub item: String,
    pub title: String,
    pub link: String,
    pub description: Option<String>,
}

/// Endpoint parameters for `api` sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiParams {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub token_url: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default = "default_per_page")]
    pub per_page: u32,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
}

fn default_per_page() -> u32 {
    100
}

fn default_max_pages() -> u32 {
    5
}

impl Default for ApiParams {
    fn default() -> Self {
        Self {
            token: None,
            token_url: None,
            client_id: None,
            client_secret: None,
            region: None,
            language: None,
            per_page: default_per_page(),
            max_pages: default_max_pages(),
        }
    }
}

/// One configured source, dispatched to the extractor matching its kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub kind: SourceKind,
    pub store: String,
    pub category: Option<String>,
    pub url: String,
    pub selectors: Option<CssSelectors>,
    pub api: Option<ApiParams>,
}

impl SourceSpec {
    pub fn new(kind: SourceKind, store: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            kind,
            store: store.into(),
            category: None,
            url: url.into(),
            selectors: None,
            api: None,
        }
    }
}

/// Per-run context threaded through every extractor.
pub struct ExtractContext<'a> {
    pub run_id: Uuid,
    pub http: &'a HttpFetcher,
    pub aliases: &'a AliasTable,
}

/// All extractors share the soft-fail contract: a fetch or parse fault is
/// logged and yields zero candidates, never an aborted run.
#[async_trait::async_trait]
pub trait Extractor: Send + Sync {
    fn kind(&self) -> SourceKind;

    async fn extract(&self, ctx: &ExtractContext<'_>, source: &SourceSpec) -> Vec<RawCandidate>;
}

fn contain_failure(
    kind: SourceKind,
    url: &str,
    result: Result<Vec<RawCandidate>, ExtractError>,
) -> Vec<RawCandidate> {
    match result {
        Ok(candidates) => {
            info!(kind = kind.as_str(), url, count = candidates.len(), "extraction finished");
            candidates
        }
        Err(err) => {
            warn!(kind = kind.as_str(), url, error = %err, "extraction failed, source skipped");
            Vec::new()
        }
    }
}

/// The full strategy set, constructed once so the affiliate token cache
/// survives across runs.
pub struct ExtractorSet {
    auto: HeuristicHtmlExtractor,
    rss: RssExtractor,
    css: CssSelectorExtractor,
    api: AffiliateApiExtractor,
    text: TextPatternExtractor,
}

impl ExtractorSet {
    pub fn new(tokens: MatchTokens) -> anyhow::Result<Self> {
        let exclude =
            Regex::new(&tokens.exclude_url_pattern).context("compiling URL exclusion pattern")?;
        let code_regex = build_code_regex(&tokens)?;
        Ok(Self {
            auto: HeuristicHtmlExtractor {
                tokens: tokens.clone(),
                exclude,
            },
            rss: RssExtractor { tokens },
            css: CssSelectorExtractor,
            api: AffiliateApiExtractor {
                token_cache: TokenCache::default(),
            },
            text: TextPatternExtractor { code_regex },
        })
    }

    pub fn for_kind(&self, kind: SourceKind) -> &dyn Extractor {
        match kind {
            SourceKind::Auto => &self.auto,
            SourceKind::Rss => &self.rss,
            SourceKind::HtmlCss => &self.css,
            SourceKind::Api => &self.api,
            SourceKind::Text => &self.text,
        }
    }
}

fn collapse_ws(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn element_text(el: &ElementRef) -> String {
    collapse_ws(&el.text().collect::<Vec<_>>().join(" "))
}

fn resolve_href(base: Option<&Url>, href: &str) -> Option<String> {
    let resolved = match base {
        Some(base) => base.join(href).ok()?,
        None => Url::parse(href).ok()?,
    };
    matches!(resolved.scheme(), "http" | "https").then(|| resolved.to_string())
}

fn char_window(text: &str, start: usize, end: usize, pad: usize) -> &str {
    let mut s = start.saturating_sub(pad);
    while s > 0 && !text.is_char_boundary(s) {
        s -= 1;
    }
    let mut e = (end + pad).min(text.len());
    while e < text.len() && !text.is_char_boundary(e) {
        e += 1;
    }
    &text[s..e]
}

/// Heuristic extractor for pages with no declared structure. Two passes: one
/// over promo-styled blocks, one over qualifying hyperlinks.
pub struct HeuristicHtmlExtractor {
    tokens: MatchTokens,
    exclude: Regex,
}

impl HeuristicHtmlExtractor {
    async fn try_extract(
        &self,
        ctx: &ExtractContext<'_>,
        source: &SourceSpec,
    ) -> Result<Vec<RawCandidate>, ExtractError> {
        let resp = ctx.http.get(ctx.run_id, &source.store, &source.url).await?;
        Ok(self.parse_page(&resp.text(), &source.url))
    }

    fn parse_page(&self, html: &str, page_url: &str) -> Vec<RawCandidate> {
        let doc = Html::parse_document(html);
        let base = Url::parse(page_url).ok();
        let anchor_sel = Selector::parse("a[href]").expect("static selector");
        let styled_sel = Selector::parse("[class], [id]").expect("static selector");
        let og_sel = Selector::parse(r#"meta[property="og:title"]"#).expect("static selector");
        let title_sel = Selector::parse("title").expect("static selector");

        let og_title = doc
            .select(&og_sel)
            .next()
            .and_then(|el| el.value().attr("content"))
            .map(collapse_ws)
            .filter(|t| !t.is_empty());
        let page_title = doc
            .select(&title_sel)
            .next()
            .map(|el| element_text(&el))
            .filter(|t| !t.is_empty());

        let mut out = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        // Pass 1: elements styled with promo-ish class/id tokens. The block's
        // own text is the title; a contained link beats the page URL.
        for el in doc.select(&styled_sel).take(STYLED_SCAN_CAP) {
            if !self.tokens.promo_class_match(&styled_attrs(&el)) {
                continue;
            }
            let text = element_text(&el);
            let chars = text.chars().count();
            if !(PROMO_BLOCK_MIN_CHARS..=PROMO_BLOCK_MAX_CHARS).contains(&chars) {
                continue;
            }
            let href = if el.value().name() == "a" {
                el.value().attr("href")
            } else {
                el.select(&anchor_sel)
                    .next()
                    .and_then(|a| a.value().attr("href"))
            };
            let url = href
                .and_then(|h| resolve_href(base.as_ref(), h))
                .unwrap_or_else(|| page_url.to_string());
            if self.exclude.is_match(&url) || !seen.insert(url.clone()) {
                continue;
            }
            out.push(RawCandidate::new(text, url, SCORE_PROMO_BLOCK, page_url));
        }

        // Pass 2: every hyperlink, gated on promotional evidence in the link
        // text, its nearby context, or its nearest styled ancestor.
        for anchor in doc.select(&anchor_sel).take(ANCHOR_SCAN_CAP) {
            let Some(raw_href) = anchor.value().attr("href") else {
                continue;
            };
            let raw_href = raw_href.trim();
            if raw_href.is_empty()
                || raw_href.starts_with('#')
                || raw_href.starts_with("javascript:")
                || raw_href.starts_with("mailto:")
            {
                continue;
            }
            let Some(url) = resolve_href(base.as_ref(), raw_href) else {
                continue;
            };
            if self.exclude.is_match(&url) || seen.contains(&url) {
                continue;
            }

            let anchor_text = element_text(&anchor);
            let qualifies = self.tokens.keyword_match(&anchor_text)
                || nearby_context(&anchor)
                    .map(|ctx| self.tokens.keyword_match(&ctx))
                    .unwrap_or(false)
                || nearest_styled_ancestor_attrs(&anchor)
                    .map(|attrs| self.tokens.promo_class_match(&attrs))
                    .unwrap_or(false);
            if !qualifies {
                continue;
            }

            // Promotional anchors are frequently generic ("Learn more"); the
            // real offer text usually lives in an ancestor heading.
            let title = if anchor_text.chars().count() >= MIN_ANCHOR_TITLE_CHARS {
                anchor_text
            } else if let Some(heading) = heading_near(&anchor) {
                heading
            } else if let Some(og) = og_title.clone() {
                og
            } else if let Some(title) = page_title.clone() {
                title
            } else {
                continue;
            };

            seen.insert(url.clone());
            out.push(RawCandidate::new(title, url, SCORE_PROMO_LINK, page_url));
        }

        out
    }
}

fn styled_attrs(el: &ElementRef) -> String {
    let class = el.value().attr("class").unwrap_or_default();
    let id = el.value().attr("id").unwrap_or_default();
    format!("{class} {id}")
}

/// Closest ancestor with a short enough text to count as the link's context.
/// Stops short of `body` so the whole document never reads as "nearby".
fn nearby_context(anchor: &ElementRef) -> Option<String> {
    anchor
        .ancestors()
        .filter_map(ElementRef::wrap)
        .take_while(|el| !matches!(el.value().name(), "body" | "html"))
        .take(2)
        .map(|el| element_text(&el))
        .find(|text| !text.is_empty() && text.chars().count() <= NEARBY_CONTEXT_MAX_CHARS)
}

fn nearest_styled_ancestor_attrs(anchor: &ElementRef) -> Option<String> {
    anchor
        .ancestors()
        .filter_map(ElementRef::wrap)
        .find(|el| el.value().attr("class").is_some() || el.value().attr("id").is_some())
        .map(|el| styled_attrs(&el))
}

/// Heading text for a generic anchor: an enclosing h1–h6, or the first
/// heading inside a near ancestor (card layouts put the offer in a sibling).
fn heading_near(anchor: &ElementRef) -> Option<String> {
    let heading_sel = Selector::parse("h1, h2, h3, h4, h5, h6").expect("static selector");
    for ancestor in anchor
        .ancestors()
        .filter_map(ElementRef::wrap)
        .take_while(|el| !matches!(el.value().name(), "body" | "html"))
        .take(3)
    {
        if matches!(ancestor.value().name(), "h1" | "h2" | "h3" | "h4" | "h5" | "h6") {
            let text = element_text(&ancestor);
            if !text.is_empty() {
                return Some(text);
            }
        }
        if let Some(heading) = ancestor.select(&heading_sel).next() {
            let text = element_text(&heading);
            if !text.is_empty() && text.chars().count() <= NEARBY_CONTEXT_MAX_CHARS {
                return Some(text);
            }
        }
    }
    None
}

#[async_trait::async_trait]
impl Extractor for HeuristicHtmlExtractor {
    fn kind(&self) -> SourceKind {
        SourceKind::Auto
    }

    async fn extract(&self, ctx: &ExtractContext<'_>, source: &SourceSpec) -> Vec<RawCandidate> {
        contain_failure(self.kind(), &source.url, self.try_extract(ctx, source).await)
    }
}

/// RSS/Atom extractor. The keyword gate keeps unrelated feed content out.
pub struct RssExtractor {
    tokens: MatchTokens,
}

impl RssExtractor {
    async fn try_extract(
        &self,
        ctx: &ExtractContext<'_>,
        source: &SourceSpec,
    ) -> Result<Vec<RawCandidate>, ExtractError> {
        let resp = ctx.http.get(ctx.run_id, &source.store, &source.url).await?;
        let feed = feed_rs::parser::parse(&resp.body[..])
            .map_err(|err| ExtractError::Parse(format!("feed parse: {err}")))?;
        Ok(self.feed_candidates(feed, &source.url))
    }

    fn feed_candidates(&self, feed: feed_rs::model::Feed, feed_url: &str) -> Vec<RawCandidate> {
        feed.entries
            .into_iter()
            .take(FEED_ENTRY_CAP)
            .filter_map(|entry| {
                let link = entry
                    .links
                    .first()
                    .map(|l| l.href.clone())
                    .or_else(|| entry.id.starts_with("http").then(|| entry.id.clone()))?;
                let title = entry
                    .title
                    .map(|t| collapse_ws(&t.content))
                    .filter(|t| !t.is_empty())?;
                let summary = entry
                    .summary
                    .map(|t| collapse_ws(&t.content))
                    .unwrap_or_default();
                if !self.tokens.keyword_match(&title) && !self.tokens.keyword_match(&summary) {
                    return None;
                }
                let mut candidate = RawCandidate::new(title, link, SCORE_RSS, feed_url);
                candidate.description = summary;
                candidate.start_at = entry.published.or(entry.updated);
                Some(candidate)
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl Extractor for RssExtractor {
    fn kind(&self) -> SourceKind {
        SourceKind::Rss
    }

    async fn extract(&self, ctx: &ExtractContext<'_>, source: &SourceSpec) -> Vec<RawCandidate> {
        contain_failure(self.kind(), &source.url, self.try_extract(ctx, source).await)
    }
}

/// Extractor for sources with an explicit `{item, title, link, description?}`
/// selector set.
pub struct CssSelectorExtractor;

impl CssSelectorExtractor {
    async fn try_extract(
        &self,
        ctx: &ExtractContext<'_>,
        source: &SourceSpec,
    ) -> Result<Vec<RawCandidate>, ExtractError> {
        let Some(selectors) = &source.selectors else {
            return Err(ExtractError::Parse("html_css source missing selectors".into()));
        };
        let resp = ctx.http.get(ctx.run_id, &source.store, &source.url).await?;
        parse_css_page(&resp.text(), &source.url, selectors)
    }
}

fn parse_selector(raw: &str, role: &str) -> Result<Selector, ExtractError> {
    Selector::parse(raw)
        .map_err(|err| ExtractError::Parse(format!("invalid {role} selector {raw:?}: {err}")))
}

fn parse_css_page(
    html: &str,
    page_url: &str,
    selectors: &CssSelectors,
) -> Result<Vec<RawCandidate>, ExtractError> {
    let item_sel = parse_selector(&selectors.item, "item")?;
    let title_sel = parse_selector(&selectors.title, "title")?;
    let link_sel = parse_selector(&selectors.link, "link")?;
    let desc_sel = selectors
        .description
        .as_deref()
        .map(|raw| parse_selector(raw, "description"))
        .transpose()?;

    let doc = Html::parse_document(html);
    let base = Url::parse(page_url).ok();
    let mut out = Vec::new();

    for item in doc.select(&item_sel).take(CSS_ITEM_CAP) {
        // A missing required sub-element skips the item, not the page.
        let Some(title_el) = item.select(&title_sel).next() else {
            continue;
        };
        let Some(link_el) = item.select(&link_sel).next() else {
            continue;
        };
        let title = element_text(&title_el);
        let Some(href) = link_el.value().attr("href") else {
            continue;
        };
        let Some(url) = resolve_href(base.as_ref(), href) else {
            continue;
        };
        let mut candidate = RawCandidate::new(title, url, SCORE_CSS, page_url);
        if let Some(desc_sel) = &desc_sel {
            if let Some(desc_el) = item.select(desc_sel).next() {
                candidate.description = element_text(&desc_el);
            }
        }
        out.push(candidate);
    }
    Ok(out)
}

#[async_trait::async_trait]
impl Extractor for CssSelectorExtractor {
    fn kind(&self) -> SourceKind {
        SourceKind::HtmlCss
    }

    async fn extract(&self, ctx: &ExtractContext<'_>, source: &SourceSpec) -> Vec<RawCandidate> {
        contain_failure(self.kind(), &source.url, self.try_extract(ctx, source).await)
    }
}

const STATIC_TOKEN_TTL_SECS: i64 = 30 * 24 * 3600;
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    /// Fresh while more than the refresh margin remains, so exchanges are
    /// renewed proactively rather than on 401s.
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - chrono::Duration::seconds(TOKEN_REFRESH_MARGIN_SECS) > now
    }
}

/// Explicit cache for the affiliate bearer credential, owned by the API
/// extractor rather than floating in module state.
#[derive(Debug, Default)]
pub struct TokenCache {
    inner: Mutex<Option<CachedToken>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

impl TokenCache {
    async fn bearer(
        &self,
        ctx: &ExtractContext<'_>,
        source_id: &str,
        params: &ApiParams,
    ) -> Result<String, ExtractError> {
        let mut slot = self.inner.lock().await;
        let now = Utc::now();
        if let Some(cached) = slot.as_ref() {
            if cached.is_fresh(now) {
                return Ok(cached.token.clone());
            }
        }

        if let Some(token) = &params.token {
            *slot = Some(CachedToken {
                token: token.clone(),
                expires_at: now + chrono::Duration::seconds(STATIC_TOKEN_TTL_SECS),
            });
            return Ok(token.clone());
        }

        let (Some(token_url), Some(client_id), Some(client_secret)) =
            (&params.token_url, &params.client_id, &params.client_secret)
        else {
            return Err(ExtractError::Parse(
                "api source has neither a static token nor client credentials".into(),
            ));
        };

        let form = vec![
            ("grant_type".to_string(), "client_credentials".to_string()),
            ("client_id".to_string(), client_id.clone()),
            ("client_secret".to_string(), client_secret.clone()),
        ];
        let resp = ctx
            .http
            .post_form(ctx.run_id, source_id, token_url, &form)
            .await?;
        let parsed: TokenResponse = serde_json::from_slice(&resp.body)
            .map_err(|err| ExtractError::Parse(format!("token response: {err}")))?;

        let expires_in = parsed.expires_in.max(TOKEN_REFRESH_MARGIN_SECS);
        *slot = Some(CachedToken {
            token: parsed.access_token.clone(),
            expires_at: now + chrono::Duration::seconds(expires_in),
        });
        Ok(parsed.access_token)
    }
}

#[derive(Debug, Deserialize)]
struct OfferPage {
    #[serde(default)]
    items: Vec<ApiOffer>,
    #[allow(dead_code)]
    #[serde(default)]
    page: u32,
    #[serde(default)]
    total_pages: u32,
}

#[derive(Debug, Deserialize)]
struct ApiOffer {
    #[serde(default, alias = "campaign")]
    advertiser: Option<String>,
    #[serde(default)]
    site: Option<String>,
    #[serde(default, alias = "name")]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default, alias = "link")]
    url: Option<String>,
    #[serde(default, alias = "promocode")]
    coupon_code: Option<String>,
    #[serde(default)]
    cashback: Option<f64>,
    #[serde(default, alias = "date_start")]
    start_at: Option<String>,
    #[serde(default, alias = "date_end")]
    end_at: Option<String>,
}

fn parse_api_date(raw: &str, end_of_day: bool) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Some(parsed.and_utc());
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()?;
    let time = if end_of_day { (23, 59, 59) } else { (0, 0, 0) };
    date.and_hms_opt(time.0, time.1, time.2).map(|dt| dt.and_utc())
}

fn map_offer(offer: ApiOffer, aliases: &AliasTable, endpoint: &str) -> Option<RawCandidate> {
    let title = offer.title.map(|t| collapse_ws(&t)).filter(|t| !t.is_empty())?;
    let url = offer.url.filter(|u| !u.trim().is_empty())?;
    let store_hint = offer
        .advertiser
        .or(offer.site)
        .map(|name| aliases.resolve_substring(&name).unwrap_or(name));

    let mut candidate = RawCandidate::new(title, url, SCORE_API, endpoint);
    candidate.description = offer.description.map(|d| collapse_ws(&d)).unwrap_or_default();
    candidate.coupon_code = offer
        .coupon_code
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty());
    candidate.cashback = offer.cashback;
    candidate.start_at = offer.start_at.as_deref().and_then(|raw| parse_api_date(raw, false));
    candidate.end_at = offer.end_at.as_deref().and_then(|raw| parse_api_date(raw, true));
    candidate.store_hint = store_hint;
    Some(candidate)
}

/// Token-authenticated paginated affiliate listing endpoint.
pub struct AffiliateApiExtractor {
    token_cache: TokenCache,
}

impl AffiliateApiExtractor {
    async fn try_extract(
        &self,
        ctx: &ExtractContext<'_>,
        source: &SourceSpec,
    ) -> Result<Vec<RawCandidate>, ExtractError> {
        let params = source.api.clone().unwrap_or_default();
        let bearer = self.token_cache.bearer(ctx, &source.store, &params).await?;

        let mut out = Vec::new();
        for page in 1..=params.max_pages.max(1) {
            let mut query = vec![
                ("page".to_string(), page.to_string()),
                ("per_page".to_string(), params.per_page.to_string()),
                ("active".to_string(), "true".to_string()),
            ];
            if let Some(region) = &params.region {
                query.push(("region".to_string(), region.clone()));
            }
            if let Some(language) = &params.language {
                query.push(("language".to_string(), language.clone()));
            }

            let resp = ctx
                .http
                .get_with(ctx.run_id, &source.store, &source.url, Some(&bearer), &query)
                .await?;
            let parsed: OfferPage = serde_json::from_slice(&resp.body)
                .map_err(|err| ExtractError::Parse(format!("offer page {page}: {err}")))?;

            let batch = parsed.items.len();
            out.extend(
                parsed
                    .items
                    .into_iter()
                    .filter_map(|offer| map_offer(offer, ctx.aliases, &source.url)),
            );
            if batch == 0 || (parsed.total_pages > 0 && page >= parsed.total_pages) {
                break;
            }
        }
        Ok(out)
    }
}

#[async_trait::async_trait]
impl Extractor for AffiliateApiExtractor {
    fn kind(&self) -> SourceKind {
        SourceKind::Api
    }

    async fn extract(&self, ctx: &ExtractContext<'_>, source: &SourceSpec) -> Vec<RawCandidate> {
        contain_failure(self.kind(), &source.url, self.try_extract(ctx, source).await)
    }
}

/// Codes embedded in prose rather than markup: a label token followed by a
/// 4–16 char uppercase alphanumeric/hyphen code.
fn build_code_regex(tokens: &MatchTokens) -> anyhow::Result<Regex> {
    let labels = tokens
        .code_label_tokens
        .iter()
        .map(|label| regex::escape(label))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(
        r#"\b(?i:{labels})\s*[:\-–—]?\s*["«']?([A-Z0-9][A-Z0-9\-]{{3,15}})\b["»']?"#
    ))
    .context("compiling coupon code pattern")
}

pub struct TextPatternExtractor {
    code_regex: Regex,
}

impl TextPatternExtractor {
    async fn try_extract(
        &self,
        ctx: &ExtractContext<'_>,
        source: &SourceSpec,
    ) -> Result<Vec<RawCandidate>, ExtractError> {
        let resp = ctx.http.get(ctx.run_id, &source.store, &source.url).await?;
        Ok(self.parse_page(&resp.text(), &source.url, ctx.aliases))
    }

    fn parse_page(&self, html: &str, page_url: &str, aliases: &AliasTable) -> Vec<RawCandidate> {
        let text = {
            let doc = Html::parse_document(html);
            collapse_ws(&doc.root_element().text().collect::<Vec<_>>().join(" "))
        };
        let store_hint = host_store_hint(page_url, aliases);

        let mut seen: HashSet<String> = HashSet::new();
        let mut out = Vec::new();
        for caps in self.code_regex.captures_iter(&text) {
            let (Some(whole), Some(code)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            if !seen.insert(code.as_str().to_string()) {
                continue;
            }
            let title = collapse_ws(char_window(&text, whole.start(), whole.end(), 60));
            let mut candidate =
                RawCandidate::new(title, page_url, SCORE_TEXT_PATTERN, page_url);
            candidate.coupon_code = Some(code.as_str().to_string());
            candidate.store_hint = store_hint.clone();
            out.push(candidate);
        }
        out
    }
}

fn host_store_hint(page_url: &str, aliases: &AliasTable) -> Option<String> {
    let url = Url::parse(page_url).ok()?;
    let host = url.host_str()?.trim_start_matches("www.").to_string();
    aliases
        .resolve_substring(&host)
        .or_else(|| host.split('.').next().map(str::to_string))
}

#[async_trait::async_trait]
impl Extractor for TextPatternExtractor {
    fn kind(&self) -> SourceKind {
        SourceKind::Text
    }

    async fn extract(&self, ctx: &ExtractContext<'_>, source: &SourceSpec) -> Vec<RawCandidate> {
        contain_failure(self.kind(), &source.url, self.try_extract(ctx, source).await)
    }
}
