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

//! Daily log of when civil twilight ends, one record per local calendar date.

use crate::client::{join_url, ClientError, UpstreamClient};
use crate::gcp::MetadataTokenSource;
use crate::metrics::ProxyMetrics;
use crate::proximity::Coordinate;
use crate::twilight::TwilightService;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub const COLLECTION: &str = "duskLog";
const UPSTREAM: &str = "firestore";

#[derive(Debug, Error)]
pub enum DuskLogError {
    #[error("{0}")]
    Client(#[from] ClientError),
    #[error("malformed dusk record {0}: {1}")]
    Malformed(String, String),
}

/// When civil twilight ended on `date`, as 24-hour local time `HH:MM`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuskRecord {
    pub date: NaiveDate,
    pub dusk: String,
}

impl DuskRecord {
    /// Record for the local date and time of `dusk` in `tz`.
    pub fn from_instant(dusk: DateTime<Utc>, tz: Tz) -> Self {
        let local = dusk.with_timezone(&tz);
        DuskRecord {
            date: local.date_naive(),
            dusk: local.format("%H:%M").to_string(),
        }
    }
}

/// Storage for dusk records.
///
/// Writing a record for a date that already has one replaces it.
#[async_trait]
pub trait DuskLog: Send + Sync + fmt::Debug {
    async fn upsert(&self, record: &DuskRecord) -> Result<(), DuskLogError>;

    async fn get(&self, date: NaiveDate) -> Result<Option<DuskRecord>, DuskLogError>;
}

/// Dusk records kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryDuskLog {
    records: Mutex<BTreeMap<NaiveDate, String>>,
}

impl MemoryDuskLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DuskLog for MemoryDuskLog {
    async fn upsert(&self, record: &DuskRecord) -> Result<(), DuskLogError> {
        self.records.lock().insert(record.date, record.dusk.clone());
        Ok(())
    }

    async fn get(&self, date: NaiveDate) -> Result<Option<DuskRecord>, DuskLogError> {
        Ok(self.records.lock().get(&date).map(|dusk| DuskRecord {
            date,
            dusk: dusk.clone(),
        }))
    }
}

#[derive(Debug, Deserialize)]
struct FirestoreDocument {
    #[serde(default)]
    fields: BTreeMap<String, FirestoreValue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FirestoreValue {
    string_value: Option<String>,
}

/// Dusk records in a Firestore collection, one document per date.
///
/// Each write replaces the whole document and sets its `timestamp` field to the
/// Firestore server time of the write.
#[derive(Debug)]
pub struct FirestoreDuskLog {
    client: UpstreamClient,
    base_url: String,
    project: String,
    tokens: Arc<MetadataTokenSource>,
}

impl FirestoreDuskLog {
    pub fn new(client: UpstreamClient, base_url: &str, project: &str, tokens: Arc<MetadataTokenSource>) -> Self {
        FirestoreDuskLog {
            client,
            base_url: base_url.to_owned(),
            project: project.to_owned(),
            tokens,
        }
    }

    fn database(&self) -> String {
        format!("projects/{}/databases/(default)/documents", self.project)
    }

    fn document_name(&self, date: NaiveDate) -> String {
        format!("{}/{}/{}", self.database(), COLLECTION, date.format("%Y-%m-%d"))
    }
}

#[async_trait]
impl DuskLog for FirestoreDuskLog {
    async fn upsert(&self, record: &DuskRecord) -> Result<(), DuskLogError> {
        let token = self.tokens.token().await?;
        let url = join_url(&self.base_url, &format!("{}:commit", self.database()))?;
        let body = json!({
            "writes": [{
                "update": {
                    "name": self.document_name(record.date),
                    "fields": {
                        "dusk": {"stringValue": record.dusk},
                    },
                },
                "updateTransforms": [{
                    "fieldPath": "timestamp",
                    "setToServerValue": "REQUEST_TIME",
                }],
            }],
        });

        let req = self.client.http().post(url).bearer_auth(token).json(&body);
        self.client.send(UPSTREAM, req).await?;
        Ok(())
    }

    async fn get(&self, date: NaiveDate) -> Result<Option<DuskRecord>, DuskLogError> {
        let token = self.tokens.token().await?;
        let url = join_url(&self.base_url, &self.document_name(date))?;
        let req = self.client.http().get(url).bearer_auth(token);

        let doc: FirestoreDocument = match self.client.json(UPSTREAM, req).await {
            Ok(d) => d,
            Err(ClientError::Unexpected(StatusCode::NOT_FOUND, _)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let dusk = doc
            .fields
            .get("dusk")
            .and_then(|v| v.string_value.clone())
            .ok_or_else(|| DuskLogError::Malformed(date.to_string(), "missing dusk field".to_owned()))?;

        Ok(Some(DuskRecord { date, dusk }))
    }
}

/// Fetch today's end of civil twilight at `location` and write it to `store`.
///
/// Failures are logged and otherwise ignored; the next run will try again.
pub async fn log_dusk(
    twilight: &TwilightService,
    store: &dyn DuskLog,
    metrics: &ProxyMetrics,
    location: Coordinate,
    tz: Tz,
) -> Option<DuskRecord> {
    let lat = location.lat.to_string();
    let lng = location.lng.to_string();

    let solar = match twilight.solar_times(&lat, &lng, None).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(message = "unable to fetch twilight times for dusk log", error = %e);
            metrics.dusk_log_write(false);
            return None;
        }
    };

    let record = DuskRecord::from_instant(solar.civil_twilight_end, tz);
    match store.upsert(&record).await {
        Ok(()) => {
            tracing::info!(message = "logged dusk", date = %record.date, dusk = %record.dusk);
            metrics.dusk_log_write(true);
            Some(record)
        }
        Err(e) => {
            tracing::error!(message = "unable to write dusk log", date = %record.date, error = %e);
            metrics.dusk_log_write(false);
            None
        }
    }
}
