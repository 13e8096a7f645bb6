//! Live rate providers.
//!
//! A provider answers for the pairs it is configured with. Two HTTP kinds
//! cover the sources in use: JSON endpoints (value located by a JSON pointer)
//! and scraped pages (value is the first capture group of a regex).

use async_trait::async_trait;
use asaas_core::config::{ProviderConfig, ProviderKind, RatesConfig};
use asaas_core::error::{AsaasError, AsaasResult};
use asaas_core::types::CurrencyPair;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[async_trait]
pub trait RateProvider: Send + Sync {
    fn id(&self) -> &str;

    fn supports(&self, pair: &CurrencyPair) -> bool;

    /// Current rate for `pair`. Anything unusable is `ProviderUnavailable`.
    async fn fetch(&self, pair: &CurrencyPair) -> AsaasResult<f64>;
}

enum Extractor {
    Pointer(String),
    Pattern(Regex),
}

pub struct HttpRateProvider {
    id: String,
    url: String,
    client: reqwest::Client,
    extractors: BTreeMap<CurrencyPair, Extractor>,
    scale: f64,
    min_rate: f64,
}

impl HttpRateProvider {
    pub fn from_config(cfg: &ProviderConfig, client: reqwest::Client) -> AsaasResult<Self> {
        if cfg.id.is_empty() || cfg.url.is_empty() {
            return Err(AsaasError::Config("rate provider needs an id and a url".into()));
        }

        let mut extractors = BTreeMap::new();
        for (pair, expr) in &cfg.pairs {
            let pair: CurrencyPair = pair
                .parse()
                .map_err(|e: String| AsaasError::Config(format!("provider {}: {e}", cfg.id)))?;
            let extractor = match cfg.kind {
                ProviderKind::Json => Extractor::Pointer(expr.clone()),
                ProviderKind::Pattern => Extractor::Pattern(Regex::new(expr).map_err(|e| {
                    AsaasError::Config(format!("provider {} pattern for {pair}: {e}", cfg.id))
                })?),
            };
            extractors.insert(pair, extractor);
        }

        Ok(Self {
            id: cfg.id.clone(),
            url: cfg.url.clone(),
            client,
            extractors,
            // an unset scale deserializes as 0
            scale: if cfg.scale > 0.0 { cfg.scale } else { 1.0 },
            min_rate: cfg.min_rate,
        })
    }

    fn unavailable(&self, pair: &CurrencyPair, reason: impl Into<String>) -> AsaasError {
        AsaasError::ProviderUnavailable {
            provider: self.id.clone(),
            pair: pair.to_string(),
            reason: reason.into(),
        }
    }

    fn extract(&self, pair: &CurrencyPair, extractor: &Extractor, body: &str) -> AsaasResult<f64> {
        let raw = match extractor {
            Extractor::Pointer(pointer) => {
                let doc: serde_json::Value = serde_json::from_str(body)
                    .map_err(|e| self.unavailable(pair, format!("response is not JSON: {e}")))?;
                match doc.pointer(pointer) {
                    Some(serde_json::Value::Number(n)) => n.as_f64(),
                    Some(serde_json::Value::String(s)) => parse_rate_text(s),
                    _ => None,
                }
            }
            Extractor::Pattern(re) => re
                .captures(body)
                .and_then(|c| c.get(1))
                .and_then(|m| parse_rate_text(m.as_str())),
        };
        let Some(raw) = raw else {
            return Err(self.unavailable(pair, "rate not found in response"));
        };

        let rate = raw * self.scale;
        if !rate.is_finite() || rate <= 0.0 {
            return Err(self.unavailable(pair, format!("unusable rate {rate}")));
        }
        if rate < self.min_rate {
            return Err(self.unavailable(
                pair,
                format!("rate {rate} below sanity floor {}", self.min_rate),
            ));
        }
        Ok(rate)
    }
}

#[async_trait]
impl RateProvider for HttpRateProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn supports(&self, pair: &CurrencyPair) -> bool {
        self.extractors.contains_key(pair)
    }

    async fn fetch(&self, pair: &CurrencyPair) -> AsaasResult<f64> {
        let Some(extractor) = self.extractors.get(pair) else {
            return Err(self.unavailable(pair, "pair not configured"));
        };

        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| self.unavailable(pair, e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(self.unavailable(pair, format!("HTTP {status}")));
        }
        let body = response
            .text()
            .await
            .map_err(|e| self.unavailable(pair, e.to_string()))?;

        let rate = self.extract(pair, extractor, &body)?;
        debug!(provider = %self.id, pair = %pair, rate, "rate fetched");
        Ok(rate)
    }
}

/// Build every configured provider, in priority order, over one HTTP client.
pub fn build_providers(cfg: &RatesConfig) -> AsaasResult<Vec<Arc<dyn RateProvider>>> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(cfg.timeout_secs.max(1)))
        .build()
        .map_err(|e| AsaasError::Config(format!("building HTTP client: {e}")))?;

    cfg.providers
        .iter()
        .map(|p| {
            HttpRateProvider::from_config(p, client.clone())
                .map(|p| Arc::new(p) as Arc<dyn RateProvider>)
        })
        .collect()
}

/// Parse a scraped number. Arabic-Indic digits are accepted; `,` and `٬` are
/// grouping marks. A single `.` or `٫` is a decimal point unless it is
/// followed by exactly three digits, in which case it is grouping too
/// ("153.250" reads as 153250).
pub fn parse_rate_text(text: &str) -> Option<f64> {
    let mut normalized = String::with_capacity(text.len());
    for ch in text.trim().chars() {
        match ch {
            '0'..='9' => normalized.push(ch),
            '\u{0660}'..='\u{0669}' => {
                normalized.push(char::from(b'0' + (ch as u32 - 0x0660) as u8))
            }
            '\u{06F0}'..='\u{06F9}' => {
                normalized.push(char::from(b'0' + (ch as u32 - 0x06F0) as u8))
            }
            ',' | '\u{066C}' => {}
            '.' | '\u{066B}' => normalized.push('.'),
            _ => return None,
        }
    }

    let dots = normalized.matches('.').count();
    let grouped = match normalized.rsplit_once('.') {
        Some((_, frac)) => dots > 1 || frac.len() == 3,
        None => false,
    };
    if grouped {
        normalized.retain(|c| c != '.');
    }
    if normalized.is_empty() || normalized == "." {
        return None;
    }
    normalized.parse().ok()
}
