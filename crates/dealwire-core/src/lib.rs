//! Core domain model, alias resolution, and normalization for Dealwire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "dealwire-core";

pub const TITLE_MAX_CHARS: usize = 200;
pub const DESCRIPTION_MAX_CHARS: usize = 500;

/// Declared kind of a configured source, mapping to one extractor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Auto,
    Rss,
    HtmlCss,
    Api,
    Text,
}

impl SourceKind {
    /// Unrecognized or absent kinds fall back to the heuristic HTML extractor.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some("rss") => Self::Rss,
            Some("html_css") => Self::HtmlCss,
            Some("api") => Self::Api,
            Some("text") | Some("regex") => Self::Text,
            _ => Self::Auto,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Rss => "rss",
            Self::HtmlCss => "html_css",
            Self::Api => "api",
            Self::Text => "text",
        }
    }
}

/// Pre-normalization handoff contract from extractors into the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCandidate {
    pub title: String,
    pub description: String,
    pub url: String,
    pub coupon_code: Option<String>,
    pub price_old: Option<f64>,
    pub price_new: Option<f64>,
    pub cashback: Option<f64>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    /// Extractor-assigned base confidence; boosted by the scorer, never
    /// renormalized across candidates.
    pub base_score: f64,
    /// Provenance tag (feed URL, endpoint, page). Diagnostics only.
    pub source: String,
    /// Store identity resolved by the extractor itself, when it has one
    /// (affiliate campaigns, host-name guesses). Overrides the configured
    /// store of the source.
    pub store_hint: Option<String>,
}

impl RawCandidate {
    pub fn new(title: impl Into<String>, url: impl Into<String>, base_score: f64, source: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            url: url.into(),
            coupon_code: None,
            price_old: None,
            price_new: None,
            cashback: None,
            start_at: None,
            end_at: None,
            base_score,
            source: source.into(),
            store_hint: None,
        }
    }
}

/// Canonical persisted deal. Never mutated after insert; `created_at` is
/// stamped by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deal {
    pub store_slug: String,
    pub category: Option<String>,
    pub title: String,
    pub description: String,
    pub url: String,
    pub coupon_code: Option<String>,
    pub price_old: Option<f64>,
    pub price_new: Option<f64>,
    pub cashback: Option<f64>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub source: String,
    pub score: f64,
    pub created_at: DateTime<Utc>,
    pub content_hash: String,
}

/// SHA-256 over the deal's identity fields. Re-ingesting an unchanged offer
/// must produce the same hash; the coupon code participates so a rotated
/// code at a stable URL reads as a new offer.
pub fn content_hash(url: &str, title: &str, coupon_code: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hasher.update(b"\n");
    hasher.update(title.as_bytes());
    hasher.update(b"\n");
    hasher.update(coupon_code.unwrap_or_default().as_bytes());
    hex::encode(hasher.finalize())
}

/// One canonical merchant plus the free-text forms that resolve to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasEntry {
    pub slug: String,
    pub aliases: Vec<String>,
}

/// The single alias table shared by all extractors and the query-side
/// resolver. Keys are matched case-insensitively with punctuation stripped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasTable {
    pub entries: Vec<AliasEntry>,
}

impl AliasTable {
    pub fn new(entries: Vec<AliasEntry>) -> Self {
        Self { entries }
    }

    /// Exact resolution of a free-text store name to a canonical slug.
    pub fn resolve(&self, text: &str) -> Option<String> {
        let key = normalize_alias_key(text);
        if key.is_empty() {
            return None;
        }
        for entry in &self.entries {
            if normalize_alias_key(&entry.slug) == key {
                return Some(entry.slug.clone());
            }
            if entry.aliases.iter().any(|a| normalize_alias_key(a) == key) {
                return Some(entry.slug.clone());
            }
        }
        None
    }

    /// Substring resolution for noisy upstream names (affiliate campaign and
    /// site names like "Ozon RU - CPA"). First matching entry wins.
    pub fn resolve_substring(&self, text: &str) -> Option<String> {
        let key = normalize_alias_key(text);
        if key.is_empty() {
            return None;
        }
        for entry in &self.entries {
            if key.contains(&normalize_alias_key(&entry.slug)) {
                return Some(entry.slug.clone());
            }
            for alias in &entry.aliases {
                let alias_key = normalize_alias_key(alias);
                if !alias_key.is_empty() && key.contains(&alias_key) {
                    return Some(entry.slug.clone());
                }
            }
        }
        None
    }

    /// Resolution with the deterministic slugify fallback; always yields a
    /// non-empty slug for non-empty input.
    pub fn resolve_or_slugify(&self, text: &str) -> String {
        self.resolve(text).unwrap_or_else(|| slugify(text))
    }
}

impl Default for AliasTable {
    fn default() -> Self {
        let entry = |slug: &str, aliases: &[&str]| AliasEntry {
            slug: slug.to_string(),
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
        };
        Self::new(vec![
            entry("wildberries", &["wb", "вб", "вайлдберриз", "wildberries ru"]),
            entry("ozon", &["озон", "ozon ru"]),
            entry("yandexmarket", &["яндекс маркет", "yandex market", "маркет"]),
            entry("sbermegamarket", &["мегамаркет", "megamarket", "sber megamarket"]),
            entry("mvideo", &["мвидео", "м видео", "m video"]),
            entry("eldorado", &["эльдорадо"]),
            entry("dns", &["днс", "dns shop"]),
            entry("citilink", &["ситилинк"]),
            entry("lamoda", &["ламода"]),
            entry("sportmaster", &["спортмастер"]),
            entry("letual", &["летуаль", "л этуаль", "letu"]),
            entry("apteka", &["аптека ру", "apteka ru"]),
            entry("vkusvill", &["вкусвилл"]),
            entry("perekrestok", &["перекресток", "перекрёсток"]),
            entry("magnit", &["магнит"]),
            entry("lenta", &["лента"]),
            entry("auchan", &["ашан"]),
            entry("metro", &["метро"]),
            entry("sbermarket", &["сбермаркет", "kuper", "купер"]),
            entry("aliexpress", &["али", "алиэкспресс", "ali express"]),
        ])
    }
}

/// Lowercase the key and strip punctuation so "М.Видео", "m-video" and
/// "mvideo" compare equal.
pub fn normalize_alias_key(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("")
}

/// Deterministic fallback identity: lowercase alphanumerics joined by
/// underscores.
pub fn slugify(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
        .split('_')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

/// Heuristic match tokens, kept as data rather than inline logic so locales
/// can extend them without touching extractor code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchTokens {
    /// Keywords a title/summary/anchor must contain to count as promotional.
    pub keywords: Vec<String>,
    /// Substrings of class/id attributes that mark an element as promo-ish.
    pub promo_class_tokens: Vec<String>,
    /// Regex source for URL paths that are never deals (auth, cart, support).
    pub exclude_url_pattern: String,
    /// Label tokens that precede a coupon code in prose ("code: XXXX").
    pub code_label_tokens: Vec<String>,
}

impl MatchTokens {
    pub fn keyword_match(&self, text: &str) -> bool {
        let low = text.to_lowercase();
        self.keywords.iter().any(|k| low.contains(k.as_str()))
    }

    pub fn promo_class_match(&self, class_attr: &str) -> bool {
        let low = class_attr.to_lowercase();
        self.promo_class_tokens.iter().any(|t| low.contains(t.as_str()))
    }
}

impl Default for MatchTokens {
    fn default() -> Self {
        let owned = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            keywords: owned(&[
                "акци", "скид", "купон", "промо", "распрод", "выгод", "бонус",
                "sale", "discount", "coupon", "promo", "deal", "%",
            ]),
            promo_class_tokens: owned(&[
                "promo", "sale", "discount", "coupon", "offer", "deal",
                "akci", "aktsi", "skidk", "акци", "скид",
            ]),
            exclude_url_pattern: r"(?i)(login|signin|account|lk|cart|support|faq)".to_string(),
            code_label_tokens: owned(&["promo code", "coupon code", "промокод", "купон", "code", "код"]),
        }
    }
}

/// Score boosts applied on top of the extractor base score.
const COUPON_BOOST: f64 = 0.1;
const DEADLINE_BOOST: f64 = 0.1;

/// Collapse whitespace and cap at a char bound.
pub fn clean_text(input: &str, max_chars: usize) -> String {
    let collapsed = input.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(max_chars).collect()
}

/// Map a raw candidate to a canonical deal: bounded text, resolved store
/// identity, content hash, finalized score. Returns `None` for candidates
/// with no usable title or URL; those are never persisted.
pub fn normalize(
    candidate: RawCandidate,
    configured_store: &str,
    category: Option<&str>,
    aliases: &AliasTable,
) -> Option<Deal> {
    let title = clean_text(&candidate.title, TITLE_MAX_CHARS);
    let url = candidate.url.trim().to_string();
    if title.is_empty() || url.is_empty() {
        return None;
    }

    let store_name = candidate.store_hint.as_deref().unwrap_or(configured_store);
    let store_slug = aliases.resolve_or_slugify(store_name);
    if store_slug.is_empty() {
        return None;
    }

    let description = clean_text(&candidate.description, DESCRIPTION_MAX_CHARS);
    let coupon_code = candidate
        .coupon_code
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string);

    let mut score = candidate.base_score;
    if coupon_code.is_some() {
        score += COUPON_BOOST;
    }
    if candidate.end_at.is_some() {
        score += DEADLINE_BOOST;
    }

    let content_hash = content_hash(&url, &title, coupon_code.as_deref());

    Some(Deal {
        store_slug,
        category: category.map(|c| c.to_string()).filter(|c| !c.is_empty()),
        title,
        description,
        url,
        coupon_code,
        price_old: candidate.price_old,
        price_new: candidate.price_new,
        cashback: candidate.cashback,
        start_at: candidate.start_at,
        end_at: candidate.end_at,
        source: candidate.source,
        score,
        created_at: Utc::now(),
        content_hash,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn content_hash_is_stable_and_code_aware() {
        let a = content_hash("https://shop.example/promo", "20% off everything", None);
        let b = content_hash("https://shop.example/promo", "20% off everything", None);
        let c = content_hash("https://shop.example/promo", "20% off everything", Some("SAVE20"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn alias_resolution_is_script_and_case_insensitive() {
        let table = AliasTable::default();
        assert_eq!(table.resolve("ВБ").as_deref(), Some("wildberries"));
        assert_eq!(table.resolve("wildberries").as_deref(), Some("wildberries"));
        assert_eq!(table.resolve("WildBerries").as_deref(), Some("wildberries"));
        assert_eq!(table.resolve("М.Видео").as_deref(), Some("mvideo"));
        assert_eq!(table.resolve("unknown shop"), None);
    }

    #[test]
    fn substring_resolution_handles_campaign_names() {
        let table = AliasTable::default();
        assert_eq!(
            table.resolve_substring("Ozon RU — marketplace CPA").as_deref(),
            Some("ozon")
        );
        assert_eq!(
            table.resolve_substring("Яндекс Маркет (RU, CIS)").as_deref(),
            Some("yandexmarket")
        );
        assert_eq!(table.resolve_substring("Totally Unknown Shop"), None);
    }

    #[test]
    fn slugify_fallback_is_lowercase_alnum_underscores() {
        assert_eq!(slugify("Some Store / RU"), "some_store_ru");
        assert_eq!(slugify("--"), "");
        assert_eq!(slugify("Магнит Косметик"), "магнит_косметик");
    }

    #[test]
    fn source_kind_defaults_to_auto() {
        assert_eq!(SourceKind::parse(Some("rss")), SourceKind::Rss);
        assert_eq!(SourceKind::parse(Some("html_css")), SourceKind::HtmlCss);
        assert_eq!(SourceKind::parse(Some("api")), SourceKind::Api);
        assert_eq!(SourceKind::parse(Some("text")), SourceKind::Text);
        assert_eq!(SourceKind::parse(Some("auto_html")), SourceKind::Auto);
        assert_eq!(SourceKind::parse(None), SourceKind::Auto);
    }

    #[test]
    fn normalize_truncates_and_scores() {
        let mut candidate = RawCandidate::new(
            "s".repeat(400),
            "https://shop.example/sale",
            0.8,
            "https://shop.example",
        );
        candidate.description = "d".repeat(900);
        candidate.coupon_code = Some("SAVE10".to_string());
        candidate.end_at = Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).single();

        let deal = normalize(candidate, "ozon", Some("акции"), &AliasTable::default()).unwrap();
        assert_eq!(deal.title.chars().count(), TITLE_MAX_CHARS);
        assert_eq!(deal.description.chars().count(), DESCRIPTION_MAX_CHARS);
        assert_eq!(deal.store_slug, "ozon");
        assert_eq!(deal.category.as_deref(), Some("акции"));
        assert!((deal.score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn normalize_rejects_empty_identity() {
        let no_title = RawCandidate::new("   ", "https://shop.example/x", 0.8, "src");
        assert!(normalize(no_title, "ozon", None, &AliasTable::default()).is_none());

        let no_url = RawCandidate::new("Sale", "  ", 0.8, "src");
        assert!(normalize(no_url, "ozon", None, &AliasTable::default()).is_none());
    }

    #[test]
    fn normalize_prefers_store_hint_and_falls_back_to_slugify() {
        let mut candidate = RawCandidate::new("Sale", "https://x.example", 0.9, "api");
        candidate.store_hint = Some("Wildberries RU - CPA".to_string());
        let deal = normalize(candidate, "ignored", None, &AliasTable::default()).unwrap();
        // Exact resolve fails on the noisy name; slugify keeps it deterministic.
        assert_eq!(deal.store_slug, "wildberries_ru_cpa");

        let plain = RawCandidate::new("Sale", "https://x.example", 0.9, "api");
        let deal = normalize(plain, "ВБ", None, &AliasTable::default()).unwrap();
        assert_eq!(deal.store_slug, "wildberries");
    }
}
