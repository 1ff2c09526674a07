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

use crate::client::{join_url, ClientError, UpstreamClient};
use crate::secrets::{Secret, SecretCache};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

const AEROAPI_UPSTREAM: &str = "aeroapi";
const FAA_UPSTREAM: &str = "faa";
const AEROAPI_KEY_HEADER: &str = "x-apikey";

/// Reason the FAA gives for an airport operating normally.
pub const NO_KNOWN_DELAYS: &str = "No known delays for this airport";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AirportDelays {
    #[serde(default)]
    pub delays: Vec<AirportDelay>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AirportDelay {
    #[serde(default)]
    pub airport: String,
    #[serde(default)]
    pub reasons: Vec<DelayReason>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DelayReason {
    #[serde(default)]
    pub reason: String,
}

impl AirportDelays {
    /// Every delay reason for `airport`, one per line.
    pub fn reasons_for(&self, airport: &str) -> String {
        self.delays
            .iter()
            .filter(|d| d.airport == airport)
            .flat_map(|d| d.reasons.iter().map(|r| r.reason.as_str()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Ground stops and delays at an airport from the FAA, `None` when operating normally.
pub fn ground_stop_status(status: &Value) -> Result<Option<Value>, ClientError> {
    let delayed = status.get("Delay").and_then(Value::as_bool).unwrap_or(false);
    let entries = status
        .get("Status")
        .ok_or_else(|| ClientError::Malformed(FAA_UPSTREAM, "missing Status".to_owned()))?;

    let first_reason = entries.pointer("/0/Reason").and_then(Value::as_str);
    if !delayed && first_reason == Some(NO_KNOWN_DELAYS) {
        Ok(None)
    } else {
        Ok(Some(entries.clone()))
    }
}

/// Airport delays from FlightAware AeroAPI and the FAA airport status service.
#[derive(Debug)]
pub struct FlightService {
    client: UpstreamClient,
    secrets: Arc<SecretCache>,
    aeroapi_url: String,
    faa_url: String,
}

impl FlightService {
    pub fn new(client: UpstreamClient, secrets: Arc<SecretCache>, aeroapi_url: &str, faa_url: &str) -> Self {
        FlightService {
            client,
            secrets,
            aeroapi_url: aeroapi_url.to_owned(),
            faa_url: faa_url.to_owned(),
        }
    }

    /// Reasons for current delays at `airport` (an ICAO code), one per line.
    pub async fn delays(&self, airport: &str) -> Result<String, ClientError> {
        let key = self.secrets.get(Secret::AeroApi).await?;
        let mut url = join_url(&self.aeroapi_url, "airports/delays")?;
        url.query_pairs_mut().append_pair("airport_code", airport);
        tracing::debug!(message = "making airport delays request", airport = airport);

        let req = self.client.http().get(url).header(AEROAPI_KEY_HEADER, key);
        let res: AirportDelays = self.client.json(AEROAPI_UPSTREAM, req).await?;
        Ok(res.reasons_for(airport))
    }

    /// Ground stops at `airport` (an FAA code), `None` when there are none.
    pub async fn ground_stops(&self, airport: &str) -> Result<Option<Value>, ClientError> {
        let url = join_url(&self.faa_url, &format!("airport/status/{}", airport))?;
        let res: Value = self.client.json(FAA_UPSTREAM, self.client.http().get(url)).await?;
        ground_stop_status(&res)
    }
}
