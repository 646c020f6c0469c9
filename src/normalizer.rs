use regex::Regex;
use tracing::debug;

use crate::types::{ExtractedRecord, RawFragment, SortKey};

/// Turns raw extracted fragments into structured records and provides the
/// cross-record operations (dedup, price filter, sort, limit) the engine
/// applies over a whole result set. Pure computation, no side effects.
pub struct ContentNormalizer {
    price_patterns: Vec<Regex>,
    rating_patterns: Vec<Regex>,
    numeric: Regex,
    whitespace: Regex,
    noise: Regex,
}

impl Default for ContentNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentNormalizer {
    pub fn new() -> Self {
        let rx = |p: &str| Regex::new(p).expect("valid regex");
        Self {
            // Ordered: symbol-prefixed, textual suffix, code-prefixed variants.
            price_patterns: vec![
                rx(r"₹\s*(\d+(?:,\d{3})*(?:\.\d{2})?)"),
                rx(r"(?i)Rs\.?\s*(\d+(?:,\d{3})*(?:\.\d{2})?)"),
                rx(r"(?i)INR\s*(\d+(?:,\d{3})*(?:\.\d{2})?)"),
                rx(r"(?i)(\d+(?:,\d{3})*(?:\.\d{2})?)\s*rupees?"),
                rx(r"(\d+(?:,\d{3})*(?:\.\d{2})?)\s*₹"),
            ],
            rating_patterns: vec![
                rx(r"(?i)(\d+(?:\.\d+)?)\s*out\s*of\s*5"),
                rx(r"(?i)(\d+(?:\.\d+)?)\s*/\s*5"),
                rx(r"(?i)(\d+(?:\.\d+)?)\s*stars?"),
                rx(r"(?i)rating[:\s]*(\d+(?:\.\d+)?)"),
            ],
            numeric: rx(r"(\d+(?:,\d{3})*(?:\.\d{2})?)"),
            whitespace: rx(r"\s+"),
            noise: rx(r"[^\w\s.,!?₹$€£¥]"),
        }
    }

    /// Build one record per fragment, discarding fragments that yield none of
    /// title, price, url or description.
    pub fn normalize(&self, fragments: &[RawFragment]) -> Vec<ExtractedRecord> {
        let records: Vec<ExtractedRecord> = fragments
            .iter()
            .filter_map(|f| self.normalize_fragment(f))
            .collect();
        debug!(fragments = fragments.len(), records = records.len(), "normalized fragments");
        records
    }

    fn normalize_fragment(&self, fragment: &RawFragment) -> Option<ExtractedRecord> {
        let mut record = ExtractedRecord::default();

        if let Some(text) = fragment.text.as_deref() {
            let cleaned = self.clean_text(text);
            if !cleaned.is_empty() {
                // The upstream data has a single text field, so title and
                // description share it.
                record.title = Some(cleaned.clone());
                record.description = Some(cleaned);
            }
            record.price = self.extract_price(text);
            record.rating = self.extract_rating(text);
        }

        if let Some(href) = fragment.attributes.get("href") {
            record.url = Some(normalize_url(href));
        }
        if let Some(src) = fragment.attributes.get("src") {
            record.image_url = Some(normalize_url(src));
        }

        record.raw = serde_json::to_value(fragment).unwrap_or_default();

        record.is_meaningful().then_some(record)
    }

    fn clean_text(&self, text: &str) -> String {
        let collapsed = self.whitespace.replace_all(text, " ");
        self.noise.replace_all(&collapsed, "").trim().to_string()
    }

    /// Scan for a price token, normalizing to a currency-tagged string.
    pub fn extract_price(&self, text: &str) -> Option<String> {
        for pattern in &self.price_patterns {
            if let Some(captures) = pattern.captures(text) {
                // Group 1 is the bare amount; tag it with the currency symbol.
                let amount = captures.get(1)?.as_str();
                return Some(format!("₹{amount}"));
            }
        }
        None
    }

    pub fn extract_rating(&self, text: &str) -> Option<String> {
        for pattern in &self.rating_patterns {
            if let Some(captures) = pattern.captures(text) {
                return Some(captures.get(1)?.as_str().to_string());
            }
        }
        None
    }

    /// First numeric token of a price string, commas stripped.
    pub fn price_value(&self, price: &str) -> Option<f64> {
        let m = self.numeric.captures(price)?;
        m.get(1)?.as_str().replace(',', "").parse().ok()
    }

    /// Remove duplicates by a composite key over `key_fields` (case- and
    /// whitespace-insensitive). First occurrence wins.
    pub fn deduplicate(&self, records: Vec<ExtractedRecord>, key_fields: &[&str]) -> Vec<ExtractedRecord> {
        let mut seen = std::collections::HashSet::new();
        let mut unique = Vec::with_capacity(records.len());

        for record in records {
            let key: String = key_fields
                .iter()
                .filter_map(|field| field_value(&record, field))
                .map(|v| v.to_lowercase().trim().to_string())
                .collect::<Vec<_>>()
                .join("|");
            if seen.insert(key) {
                unique.push(record);
            }
        }
        unique
    }

    /// Keep records whose parsed price falls inside the inclusive bounds.
    /// While a bound is active, records without a parsable price are dropped.
    pub fn filter_by_price(
        &self,
        records: Vec<ExtractedRecord>,
        min_price: Option<f64>,
        max_price: Option<f64>,
    ) -> Vec<ExtractedRecord> {
        if min_price.is_none() && max_price.is_none() {
            return records;
        }

        records
            .into_iter()
            .filter(|record| {
                let Some(value) = record.price.as_deref().and_then(|p| self.price_value(p)) else {
                    return false;
                };
                if max_price.is_some_and(|max| value > max) {
                    return false;
                }
                if min_price.is_some_and(|min| value < min) {
                    return false;
                }
                true
            })
            .collect()
    }

    /// Stable descending sort by rating; unparsable ratings count as 0.
    pub fn sort_by_rating(&self, mut records: Vec<ExtractedRecord>) -> Vec<ExtractedRecord> {
        let value = |r: &ExtractedRecord| -> f64 {
            r.rating
                .as_deref()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0)
        };
        records.sort_by(|a, b| {
            value(b)
                .partial_cmp(&value(a))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        records
    }

    /// Stable ascending sort by price; unparsable prices sink to the end.
    pub fn sort_by_price(&self, mut records: Vec<ExtractedRecord>) -> Vec<ExtractedRecord> {
        let value = |r: &ExtractedRecord| -> f64 {
            r.price
                .as_deref()
                .and_then(|p| self.price_value(p))
                .unwrap_or(f64::INFINITY)
        };
        records.sort_by(|a, b| {
            value(a)
                .partial_cmp(&value(b))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        records
    }

    pub fn sort_by(&self, records: Vec<ExtractedRecord>, key: SortKey) -> Vec<ExtractedRecord> {
        match key {
            SortKey::Rating => self.sort_by_rating(records),
            SortKey::Price => self.sort_by_price(records),
        }
    }

    pub fn limit(&self, mut records: Vec<ExtractedRecord>, limit: usize) -> Vec<ExtractedRecord> {
        records.truncate(limit);
        records
    }
}

fn field_value<'a>(record: &'a ExtractedRecord, field: &str) -> Option<&'a str> {
    match field {
        "title" => record.title.as_deref(),
        "price" => record.price.as_deref(),
        "url" => record.url.as_deref(),
        "description" => record.description.as_deref(),
        "rating" => record.rating.as_deref(),
        "image_url" => record.image_url.as_deref(),
        _ => None,
    }
}

/// Normalize relative and protocol-relative URLs to absolute form.
fn normalize_url(url: &str) -> String {
    if url.is_empty() {
        return String::new();
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else if let Some(rest) = url.strip_prefix("//") {
        format!("https://{rest}")
    } else if url.starts_with('/') {
        format!("https://example.com{url}")
    } else {
        format!("https://{url}")
    }
}
