// radarb - Weather and traffic dashboard backend for Lakewood, Ohio
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

//! Lakewood City Schools closing status during the winter season.

use crate::cache::{CacheKey, TtlCache};
use crate::client::{ClientError, UpstreamClient, BROWSER_USER_AGENT};
use crate::secrets::{Secret, SecretCache};
use chrono::{Datelike, NaiveDate, Utc};
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, ORIGIN, REFERER, USER_AGENT};
use scraper::{Html, Selector};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const SPECTRUM_UPSTREAM: &str = "spectrum";
const FOX8_UPSTREAM: &str = "fox8";
const VERTEX_UPSTREAM: &str = "vertex";
const VERTEX_KEY_HEADER: &str = "x-goog-api-key";

pub const CLOSINGS_TTL: Duration = Duration::from_secs(6 * 60 * 60);

pub const TARGETS: [&str; 3] = [
    "Lakewood City Schools",
    "Lakewood Public Schools",
    "Lakewood City School District",
];

const PREFERRED_NAME: &str = "lakewood city schools";
const DISTRICT_NAME: &str = "lakewood city school district";
const EXCLUDED: &str = "catholic";

/// True between April 15 and December 1 (inclusive), when schools don't close for weather.
pub fn is_off_season(date: NaiveDate) -> bool {
    let (month, day) = (date.month(), date.day());
    let after_start = month > 4 || (month == 4 && day >= 15);
    let before_end = month < 12 || (month == 12 && day <= 1);
    after_start && before_end
}

/// Lowercase with runs of whitespace collapsed to one space.
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

fn is_target(normalized: &str) -> bool {
    TARGETS.iter().any(|t| normalized.contains(&t.to_lowercase()))
}

/// Any JSON scalar as text, `None` for null.
fn loose_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    })
}

fn loose_string_or_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(loose_string(deserializer)?.unwrap_or_default())
}

fn loose_status<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(loose_string(deserializer)?.unwrap_or_else(unknown))
}

/// Entries that aren't closings are skipped instead of failing the group.
fn lenient_closings<'de, D>(deserializer: D) -> Result<Vec<SpectrumClosing>, D::Error>
where
    D: Deserializer<'de>,
{
    let entries: Vec<Value> = match Value::deserialize(deserializer)? {
        Value::Array(entries) => entries,
        _ => Vec::new(),
    };

    Ok(entries
        .into_iter()
        .filter_map(|v| match serde_json::from_value(v) {
            Ok(c) => Some(c),
            Err(e) => {
                tracing::debug!(message = "skipping malformed Spectrum closing", error = %e);
                None
            }
        })
        .collect())
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpectrumClosing {
    #[serde(default, deserialize_with = "loose_string")]
    pub account_name: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub expires: Option<String>,
}

impl SpectrumClosing {
    fn normalized_name(&self) -> String {
        normalize_name(self.account_name.as_deref().unwrap_or_default())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpectrumGroup {
    #[serde(default, deserialize_with = "loose_string")]
    org_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_closings")]
    closings: Vec<SpectrumClosing>,
}

/// Closings for Lakewood public schools and the single best of them.
///
/// Private schools are excluded. The best match is the exact district name, then
/// the formal district name, then whatever matched first.
pub fn select_match(closings: &[SpectrumClosing]) -> (Option<&SpectrumClosing>, Vec<&SpectrumClosing>) {
    let matches: Vec<&SpectrumClosing> = closings
        .iter()
        .filter(|c| {
            let name = c.normalized_name();
            !name.is_empty() && !name.contains(EXCLUDED) && is_target(&name)
        })
        .collect();

    let best = matches
        .iter()
        .find(|c| c.normalized_name() == PREFERRED_NAME)
        .or_else(|| matches.iter().find(|c| c.normalized_name().contains(DISTRICT_NAME)))
        .or_else(|| matches.first())
        .copied();

    (best, matches)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosingMatch {
    #[serde(default, deserialize_with = "loose_string_or_empty")]
    pub name: String,
    #[serde(default = "unknown", deserialize_with = "loose_status")]
    pub status: String,
    #[serde(default, deserialize_with = "loose_string_or_empty")]
    pub reason: String,
    #[serde(default, deserialize_with = "loose_string_or_empty")]
    pub source: String,
    #[serde(default, deserialize_with = "loose_string_or_empty")]
    pub confidence: String,
    #[serde(default, deserialize_with = "loose_string", skip_serializing_if = "Option::is_none")]
    pub expires: Option<String>,
}

fn unknown() -> String {
    "unknown".to_owned()
}

impl ClosingMatch {
    fn from_spectrum(c: &SpectrumClosing) -> Self {
        ClosingMatch {
            name: c.account_name.clone().unwrap_or_default(),
            status: c.status.clone().filter(|s| !s.is_empty()).unwrap_or_else(unknown),
            reason: "Spectrum closings feed".to_owned(),
            source: "spectrumnews1.com".to_owned(),
            confidence: "high".to_owned(),
            expires: Some(c.expires.clone().unwrap_or_default()),
        }
    }

    fn unparseable() -> Self {
        ClosingMatch {
            name: TARGETS[0].to_owned(),
            status: unknown(),
            reason: "Unable to parse model response".to_owned(),
            source: "fox8.com".to_owned(),
            confidence: "low".to_owned(),
            expires: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClosingSummary {
    pub name: String,
    pub status: String,
    pub expires: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosingsReport {
    /// Milliseconds since the epoch.
    pub updated_at: i64,
    #[serde(rename = "match")]
    pub closing: Option<ClosingMatch>,
    pub source_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matches: Option<Vec<ClosingSummary>>,
}

/// A `.closing` block from the FOX 8 closings page that names a target school.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateBlock {
    pub title: String,
    pub html: String,
    pub text: String,
}

/// Every closing block on the FOX 8 page whose title names a target school.
pub fn candidate_blocks(page: &str) -> Result<Vec<CandidateBlock>, ClientError> {
    let closing = parse_selector(".closing")?;
    let title = parse_selector(".closing__title")?;
    let doc = Html::parse_document(page);

    let blocks = doc
        .select(&closing)
        .filter_map(|el| {
            let t = el
                .select(&title)
                .flat_map(|n| n.text())
                .collect::<String>()
                .trim()
                .to_owned();
            if t.is_empty() || !is_target(&t.to_lowercase()) {
                return None;
            }

            let text = el.text().collect::<Vec<_>>().join(" ");
            Some(CandidateBlock {
                title: t,
                html: el.inner_html(),
                text: text.split_whitespace().collect::<Vec<_>>().join(" "),
            })
        })
        .collect();

    Ok(blocks)
}

fn parse_selector(s: &str) -> Result<Selector, ClientError> {
    Selector::parse(s).map_err(|e| ClientError::Malformed(FOX8_UPSTREAM, e.to_string()))
}

/// Instructions for extracting the district's status from candidate blocks.
pub fn extraction_prompt(blocks: &[CandidateBlock]) -> String {
    let candidates = blocks
        .iter()
        .enumerate()
        .map(|(i, b)| format!("#{}\nTITLE: {}\nHTML: {}\nTEXT: {}", i + 1, b.title, b.html, b.text))
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "You are extracting a school closing status from a web page fragment.\n\
         Return JSON only with keys: name, status, reason, source, confidence.\n\
         Use \"unknown\" when not present. Status should be one of: open, closed, delay, remote, unknown.\n\
         \n\
         We need the closing status for Lakewood City Schools (public school district), not other Lakewood organizations.\n\
         If multiple blocks mention Lakewood, pick the one that is a public school district and NOT a private school.\n\
         Ignore Lakewood Catholic Academy or other private entities.\n\
         \n\
         Candidate blocks:\n\
         {}\n\
         \n\
         If no matching district is found, return status \"unknown\".",
        candidates
    )
}

/// Closing status from a model's text response, tolerating Markdown code fences.
pub fn parse_model_response(text: &str) -> ClosingMatch {
    let trimmed = text.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    serde_json::from_str(unfenced).unwrap_or_else(|_| ClosingMatch::unparseable())
}

/// Finds the district's closing status, preferring the Spectrum News feed.
#[derive(Debug)]
pub struct ClosingsService {
    client: UpstreamClient,
    secrets: Arc<SecretCache>,
    spectrum_url: String,
    fox8_url: String,
    vertex_url: String,
    cache: TtlCache<ClosingsReport>,
}

impl ClosingsService {
    pub fn new(
        client: UpstreamClient,
        secrets: Arc<SecretCache>,
        spectrum_url: &str,
        fox8_url: &str,
        vertex_url: &str,
    ) -> Self {
        ClosingsService {
            client,
            secrets,
            spectrum_url: spectrum_url.to_owned(),
            fox8_url: fox8_url.to_owned(),
            vertex_url: vertex_url.to_owned(),
            cache: TtlCache::new(CLOSINGS_TTL),
        }
    }

    /// Closing status for the district, `None` when there's nothing to report.
    ///
    /// Nothing is reported outside the winter season, when no closing matches, or
    /// when every source fails.
    pub async fn closings(&self, today: NaiveDate, debug: bool) -> Option<ClosingsReport> {
        if is_off_season(today) {
            tracing::debug!(message = "skipping school closings outside winter season", date = %today);
            return None;
        }

        let key = CacheKey::from_parts([if debug { "debug" } else { "default" }]);
        let res = self.cache.get_or_fetch(&key, || self.fetch_report(debug)).await;

        match res {
            Ok((report, lookup)) => {
                self.client.metrics().cache_lookup("closings", lookup);
                Some(report).filter(|r| r.closing.is_some())
            }
            Err(e) => {
                tracing::error!(message = "unable to determine school closings", error = %e);
                None
            }
        }
    }

    async fn fetch_report(&self, debug: bool) -> Result<ClosingsReport, ClientError> {
        match self.spectrum_report(debug).await {
            Ok(r) => Ok(r),
            Err(e) => {
                tracing::warn!(message = "Spectrum closings feed failed, falling back to FOX 8", error = %e);
                self.fox8_report().await
            }
        }
    }

    async fn spectrum_report(&self, debug: bool) -> Result<ClosingsReport, ClientError> {
        let req = self
            .client
            .http()
            .get(&self.spectrum_url)
            .header(USER_AGENT, BROWSER_USER_AGENT)
            .header(ACCEPT, "application/json");
        let body: Value = self.client.json(SPECTRUM_UPSTREAM, req).await?;

        let groups: Vec<SpectrumGroup> = match body {
            Value::Array(items) => items
                .into_iter()
                .map(|v| serde_json::from_value(v).unwrap_or_default())
                .collect(),
            _ => Vec::new(),
        };

        let closings = groups
            .into_iter()
            .find(|g| {
                g.org_type
                    .as_deref()
                    .map(|t| t.to_lowercase().contains("school"))
                    .unwrap_or(false)
            })
            .map(|g| g.closings)
            .unwrap_or_default();

        let (best, matches) = select_match(&closings);
        Ok(ClosingsReport {
            updated_at: Utc::now().timestamp_millis(),
            closing: best.map(ClosingMatch::from_spectrum),
            source_url: self.spectrum_url.clone(),
            matches: if debug {
                Some(
                    matches
                        .iter()
                        .map(|c| ClosingSummary {
                            name: c.account_name.clone().unwrap_or_default(),
                            status: c.status.clone().filter(|s| !s.is_empty()).unwrap_or_else(unknown),
                            expires: c.expires.clone().unwrap_or_default(),
                        })
                        .collect(),
                )
            } else {
                None
            },
        })
    }

    async fn fox8_report(&self) -> Result<ClosingsReport, ClientError> {
        let req = self
            .client
            .http()
            .get(&self.fox8_url)
            .header(USER_AGENT, BROWSER_USER_AGENT)
            .header(ACCEPT, "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8")
            .header(ACCEPT_LANGUAGE, "en-US,en;q=0.9")
            .header(REFERER, "https://fox8.com/weather/closings/")
            .header(ORIGIN, "https://fox8.com");
        let page = self.client.text(FOX8_UPSTREAM, req).await?;
        let blocks = candidate_blocks(&page)?;
        tracing::debug!(message = "found FOX 8 closing candidates", count = blocks.len());

        let key = self.secrets.get(Secret::Vertex).await?;
        let body = json!({
            "contents": [{
                "role": "user",
                "parts": [{"text": extraction_prompt(&blocks)}],
            }],
            "generationConfig": {
                "temperature": 0.2,
                "maxOutputTokens": 200,
            },
        });

        let req = self
            .client
            .http()
            .post(&self.vertex_url)
            .header(VERTEX_KEY_HEADER, key)
            .json(&body);
        let res: Value = self.client.json(VERTEX_UPSTREAM, req).await?;
        let text = res
            .pointer("/candidates/0/content/parts/0/text")
            .and_then(Value::as_str)
            .unwrap_or_default();

        Ok(ClosingsReport {
            updated_at: Utc::now().timestamp_millis(),
            closing: Some(parse_model_response(text)),
            source_url: self.fox8_url.clone(),
            matches: None,
        })
    }
}
