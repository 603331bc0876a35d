//! Entity extraction from fetched documents
//!
//! This module turns a fetched HTML document into:
//! - A `page` entity with the title and canonical address
//! - One entity per element matched by each configured rule
//! - The identifiers discovered on the page, to be admitted to the frontier
//! - The image addresses to download as assets
//!
//! A downloaded media file becomes a single `asset` entity recording its
//! content type, size and digest.
//!
//! Extraction is pure: the same bytes always give the same entities in the
//! same order.

use crate::config::{ExtractConfig, ExtractRule};
use crate::crawler::fetcher::{Document, FetchOutcome, FetchResult};
use crate::storage::EntityRecord;
use crate::url::normalize_url;
use crate::{ConfigError, ConfigResult};
use scraper::{ElementRef, Html, Selector};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("malformed document: {0}")]
    Malformed(String),

    #[error("no document to extract from: {0}")]
    NotFetched(String),

    #[error("failed to encode entity: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Entity kind of the built-in page record
pub const PAGE_KIND: &str = "page";

/// Entity kind of a downloaded media file
pub const ASSET_KIND: &str = "asset";

/// How a document's content is handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentKind {
    Html,
    /// Media kept as an `asset` entity
    Asset(String),
    Unsupported(String),
}

impl ContentKind {
    /// Classifies by declared content type, sniffing the body when none is given
    pub fn classify(content_type: Option<&str>, body: &[u8]) -> Self {
        match content_type {
            Some(declared) => {
                let mime = declared
                    .split(';')
                    .next()
                    .unwrap_or_default()
                    .trim()
                    .to_ascii_lowercase();
                if mime == "text/html" || mime == "application/xhtml+xml" {
                    ContentKind::Html
                } else if is_asset_type(&mime) {
                    ContentKind::Asset(mime)
                } else {
                    ContentKind::Unsupported(mime)
                }
            }
            None if looks_like_html(body) => ContentKind::Html,
            None => ContentKind::Unsupported("unknown".to_string()),
        }
    }
}

fn is_asset_type(mime: &str) -> bool {
    const ARCHIVES: &[&str] = &[
        "application/pdf",
        "application/zip",
        "application/gzip",
        "application/x-tar",
        "application/x-7z-compressed",
        "application/x-rar-compressed",
        "application/vnd.rar",
        "application/octet-stream",
    ];
    ["image/", "audio/", "video/", "font/"]
        .iter()
        .any(|prefix| mime.starts_with(prefix))
        || ARCHIVES.contains(&mime)
}

fn looks_like_html(body: &[u8]) -> bool {
    let head = &body[..body.len().min(512)];
    let head = String::from_utf8_lossy(head).trim_start().to_ascii_lowercase();
    head.starts_with("<!doctype html") || head.starts_with("<html")
}

/// A structured record extracted from a document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    /// `kind:natural-key`, unique across the store
    pub key: String,
    pub kind: String,
    pub source_identifier: String,
    pub fields: BTreeMap<String, String>,
    /// Canonical JSON of `fields`
    pub content: String,
    /// Hex SHA-256 of `content`
    pub content_hash: String,
}

impl Entity {
    pub fn new(
        kind: &str,
        natural_key: &str,
        source_identifier: &str,
        fields: BTreeMap<String, String>,
    ) -> Result<Self, serde_json::Error> {
        let content = serde_json::to_string(&fields)?;
        let content_hash = digest(content.as_bytes());
        Ok(Self {
            key: format!("{}:{}", kind, natural_key),
            kind: kind.to_string(),
            source_identifier: source_identifier.to_string(),
            fields,
            content,
            content_hash,
        })
    }

    /// Sets a field, keeping `content` and `content_hash` in step
    pub fn with_field(
        mut self,
        name: &str,
        value: impl Into<String>,
    ) -> Result<Self, serde_json::Error> {
        self.fields.insert(name.to_string(), value.into());
        self.content = serde_json::to_string(&self.fields)?;
        self.content_hash = digest(self.content.as_bytes());
        Ok(self)
    }

    pub fn to_record(&self) -> EntityRecord {
        EntityRecord {
            key: self.key.clone(),
            kind: self.kind.clone(),
            source_identifier: self.source_identifier.clone(),
            content: self.content.clone(),
            content_hash: self.content_hash.clone(),
        }
    }
}

/// Everything extracted from one document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    pub entities: Vec<Entity>,
    /// Normalized identifiers found in the document, in document order
    pub discovered: Vec<Url>,
    /// Image addresses to fetch as assets
    pub assets: Vec<Url>,
}

struct CompiledRule {
    kind: String,
    selector: Selector,
    key: String,
    fields: Vec<(String, Selector)>,
}

/// Selector-driven extractor built once from configuration
pub struct Extractor {
    rules: Vec<CompiledRule>,
    assets: bool,
    title: Selector,
    canonical: Selector,
    anchors: Selector,
    images: Selector,
}

impl Extractor {
    pub fn new(config: &ExtractConfig) -> ConfigResult<Self> {
        let rules = config
            .rules
            .iter()
            .map(compile_rule)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            rules,
            assets: config.assets,
            title: selector("title")?,
            canonical: selector("link[rel='canonical'][href]")?,
            anchors: selector("a[href]")?,
            images: selector("img[src]")?,
        })
    }

    /// Extracts entities and discovered identifiers from a fetch result
    pub fn extract(&self, result: &FetchResult) -> Result<Extraction, ExtractionError> {
        match &result.outcome {
            FetchOutcome::Success(document) => self.extract_document(document),
            FetchOutcome::Failed(e) => Err(ExtractionError::NotFetched(e.to_string())),
        }
    }

    pub fn extract_document(&self, document: &Document) -> Result<Extraction, ExtractionError> {
        match ContentKind::classify(document.content_type.as_deref(), &document.body) {
            ContentKind::Html => self.extract_html(document),
            ContentKind::Asset(mime) => extract_asset(document, &mime),
            ContentKind::Unsupported(_) => Ok(Extraction::default()),
        }
    }

    fn extract_html(&self, document: &Document) -> Result<Extraction, ExtractionError> {
        let text = std::str::from_utf8(&document.body)
            .map_err(|e| ExtractionError::Malformed(format!("invalid UTF-8: {}", e)))?;
        if text.trim().is_empty() {
            return Err(ExtractionError::Malformed("empty document".to_string()));
        }

        let html = Html::parse_document(text);
        let base = &document.final_url;
        let source = document.identifier.as_str();

        let mut entities = Vec::new();
        let mut seen_keys = HashSet::new();
        let mut push = |entity: Entity| {
            if seen_keys.insert(entity.key.clone()) {
                entities.push(entity);
            }
        };

        let canonical = html
            .select(&self.canonical)
            .filter_map(|el| el.value().attr("href"))
            .find_map(|href| resolve_link(href, base));

        let mut page_fields = BTreeMap::new();
        page_fields.insert("url".to_string(), source.to_string());
        if let Some(title) = html.select(&self.title).next().and_then(element_text) {
            page_fields.insert("title".to_string(), title);
        }
        if let Some(canonical) = &canonical {
            page_fields.insert("canonical".to_string(), canonical.to_string());
        }
        push(Entity::new(PAGE_KIND, source, source, page_fields)?);

        for rule in &self.rules {
            for element in html.select(&rule.selector) {
                let Some(natural_key) = rule_key(&element, &rule.key, base) else {
                    continue;
                };
                let mut fields = BTreeMap::new();
                for (name, field_selector) in &rule.fields {
                    if let Some(value) = element.select(field_selector).next().and_then(element_text) {
                        fields.insert(name.clone(), value);
                    }
                }
                push(Entity::new(&rule.kind, &natural_key, source, fields)?);
            }
        }

        let mut assets = Vec::new();
        if self.assets {
            let mut seen = HashSet::new();
            let sources = html
                .select(&self.images)
                .filter_map(|el| el.value().attr("src"))
                .filter_map(|src| resolve_link(src, base));
            for url in sources {
                if seen.insert(url.to_string()) {
                    assets.push(url);
                }
            }
        }

        let mut discovered = Vec::new();
        let mut seen = HashSet::new();
        seen.insert(source.to_string());

        let anchors = html
            .select(&self.anchors)
            .filter(|el| el.value().attr("download").is_none())
            .filter_map(|el| el.value().attr("href"));
        for url in anchors.filter_map(|href| resolve_link(href, base)).chain(canonical) {
            if seen.insert(url.to_string()) {
                discovered.push(url);
            }
        }

        Ok(Extraction {
            entities,
            discovered,
            assets,
        })
    }
}

fn extract_asset(document: &Document, mime: &str) -> Result<Extraction, ExtractionError> {
    let source = document.identifier.as_str();

    let mut fields = BTreeMap::new();
    fields.insert("url".to_string(), source.to_string());
    if let Some(name) = asset_name(&document.final_url) {
        fields.insert("name".to_string(), name);
    }
    fields.insert("content-type".to_string(), mime.to_string());
    fields.insert("size".to_string(), document.body.len().to_string());
    fields.insert("sha256".to_string(), digest(&document.body));

    Ok(Extraction {
        entities: vec![Entity::new(ASSET_KIND, source, source, fields)?],
        ..Extraction::default()
    })
}

/// Last non-empty path segment, as the server named the file
fn asset_name(url: &Url) -> Option<String> {
    url.path_segments()?
        .rev()
        .find(|segment| !segment.is_empty())
        .map(str::to_string)
}

fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn selector(css: &str) -> ConfigResult<Selector> {
    Selector::parse(css).map_err(|e| ConfigError::InvalidPattern(format!("{}: {:?}", css, e)))
}

fn compile_rule(rule: &ExtractRule) -> ConfigResult<CompiledRule> {
    let fields = rule
        .fields
        .iter()
        .map(|(name, css)| Ok((name.clone(), selector(css)?)))
        .collect::<ConfigResult<Vec<_>>>()?;

    Ok(CompiledRule {
        kind: rule.kind.clone(),
        selector: selector(&rule.selector)?,
        key: rule.key.clone(),
        fields,
    })
}

/// Reads a rule's natural key, resolving link attributes to identifiers
fn rule_key(element: &ElementRef<'_>, attribute: &str, base: &Url) -> Option<String> {
    let raw = element.value().attr(attribute)?.trim();
    if raw.is_empty() {
        return None;
    }
    if matches!(attribute, "href" | "src") {
        return resolve_link(raw, base).map(String::from);
    }
    Some(raw.to_string())
}

fn element_text(element: ElementRef<'_>) -> Option<String> {
    let text = collapse_whitespace(&element.text().collect::<String>());
    (!text.is_empty()).then_some(text)
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Resolves a link against the document address into a normalized identifier
///
/// Returns None for non-navigational links (`javascript:`, `mailto:`, `tel:`,
/// `data:`, fragment-only) and for anything that is not http(s) once resolved.
fn resolve_link(href: &str, base: &Url) -> Option<Url> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }

    let lower = href.to_ascii_lowercase();
    if ["javascript:", "mailto:", "tel:", "data:"]
        .iter()
        .any(|scheme| lower.starts_with(scheme))
    {
        return None;
    }

    let absolute = base.join(href).ok()?;
    normalize_url(absolute.as_str()).ok()
}
