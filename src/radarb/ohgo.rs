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

use crate::cache::{CacheKey, TtlCache};
use crate::client::{join_url, ClientError, UpstreamClient};
use crate::proximity::{nearest, Coordinate, Located, Ranked};
use crate::secrets::{Secret, SecretCache};
use reqwest::header::AUTHORIZATION;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

const UPSTREAM: &str = "ohgo";
const INCIDENTS_CACHE: &str = "incidents";

pub const CAMERA_COUNT: usize = 4;
pub const SENSOR_COUNT: usize = 3;
pub const INCIDENTS_TTL: Duration = Duration::from_secs(5 * 60);

/// Surface temperature reported by sensors that aren't working.
pub const SENSOR_SENTINEL: f64 = -9999999.0;

/// Map area as sent by the caller, south-west and north-east corners.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Bounds {
    pub latsw: String,
    pub lngsw: String,
    pub latne: String,
    pub lngne: String,
}

impl Bounds {
    pub fn new(latsw: &str, lngsw: &str, latne: &str, lngne: &str) -> Self {
        Bounds {
            latsw: latsw.to_owned(),
            lngsw: lngsw.to_owned(),
            latne: latne.to_owned(),
            lngne: lngne.to_owned(),
        }
    }

    /// Bounds when every corner is present and non-empty.
    pub fn from_parts(
        latsw: Option<&str>,
        lngsw: Option<&str>,
        latne: Option<&str>,
        lngne: Option<&str>,
    ) -> Option<Self> {
        fn present(v: Option<&str>) -> Option<&str> {
            v.filter(|s| !s.is_empty())
        }

        Some(Bounds::new(
            present(latsw)?,
            present(lngsw)?,
            present(latne)?,
            present(lngne)?,
        ))
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey::from_parts([&self.latsw, &self.lngsw, &self.latne, &self.lngne])
    }

    fn south_west(&self) -> String {
        format!("{},{}", self.latsw, self.lngsw)
    }

    fn north_east(&self) -> String {
        format!("{},{}", self.latne, self.lngne)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OhgoResults<T> {
    #[serde(default = "Vec::new")]
    pub results: Vec<T>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Camera {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Located for Camera {
    fn coordinate(&self) -> Option<Coordinate> {
        Some(Coordinate::new(self.latitude?, self.longitude?))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorSite {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub surface_sensors: Vec<SurfaceSensor>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SurfaceSensor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub surface_temperature: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Located for SurfaceSensor {
    fn coordinate(&self) -> Option<Coordinate> {
        Some(Coordinate::new(self.latitude?, self.longitude?))
    }
}

/// Every working surface sensor of every site.
///
/// Sensors without their own position take the position of their site.
pub fn surface_sensors(sites: Vec<SensorSite>) -> Vec<SurfaceSensor> {
    sites
        .into_iter()
        .flat_map(|site| {
            let (lat, lng) = (site.latitude, site.longitude);
            site.surface_sensors.into_iter().map(move |mut s| {
                if s.latitude.is_none() || s.longitude.is_none() {
                    s.latitude = lat;
                    s.longitude = lng;
                }
                s
            })
        })
        .filter(|s| s.surface_temperature != Some(SENSOR_SENTINEL))
        .collect()
}

/// Client for the Ohio Department of Transportation OHGO public API.
#[derive(Debug)]
pub struct OhgoService {
    client: UpstreamClient,
    secrets: Arc<SecretCache>,
    base: String,
    incidents: TtlCache<Value>,
}

impl OhgoService {
    pub fn new(client: UpstreamClient, secrets: Arc<SecretCache>, base: &str) -> Self {
        OhgoService {
            client,
            secrets,
            base: base.to_owned(),
            incidents: TtlCache::new(INCIDENTS_TTL),
        }
    }

    /// Traffic cameras within `bounds`, as returned by OHGO.
    pub async fn cameras(&self, bounds: &Bounds) -> Result<Value, ClientError> {
        self.fetch("cameras", bounds).await
    }

    /// The cameras within `bounds` closest to `origin`.
    pub async fn nearest_cameras(&self, bounds: &Bounds, origin: Coordinate) -> Result<Vec<Ranked<Camera>>, ClientError> {
        let res: OhgoResults<Camera> = decode(self.cameras(bounds).await?)?;
        Ok(nearest(origin, res.results, CAMERA_COUNT))
    }

    /// Road weather sensor sites within `bounds`, as returned by OHGO.
    pub async fn sensors(&self, bounds: &Bounds) -> Result<Value, ClientError> {
        self.fetch("weather-sensor-sites", bounds).await
    }

    /// The working surface sensors within `bounds` closest to `origin`.
    pub async fn nearest_sensors(
        &self,
        bounds: &Bounds,
        origin: Coordinate,
    ) -> Result<Vec<Ranked<SurfaceSensor>>, ClientError> {
        let res: OhgoResults<SensorSite> = decode(self.sensors(bounds).await?)?;
        Ok(nearest(origin, surface_sensors(res.results), SENSOR_COUNT))
    }

    /// Traffic incidents within `bounds`, cached for five minutes per area.
    pub async fn incidents(&self, bounds: &Bounds) -> Result<Value, ClientError> {
        let key = bounds.cache_key();
        let (value, lookup) = self
            .incidents
            .get_or_fetch(&key, || self.fetch("incidents", bounds))
            .await?;

        self.client.metrics().cache_lookup(INCIDENTS_CACHE, lookup);
        tracing::debug!(message = "incidents lookup", key = %key, result = lookup.as_str());
        Ok(value)
    }

    async fn fetch(&self, resource: &str, bounds: &Bounds) -> Result<Value, ClientError> {
        let key = self.secrets.get(Secret::OhgoApi).await?;
        let mut url = join_url(&self.base, resource)?;
        url.query_pairs_mut()
            .append_pair("map-bounds-sw", &bounds.south_west())
            .append_pair("map-bounds-ne", &bounds.north_east());

        let req = self
            .client
            .http()
            .get(url)
            .header(AUTHORIZATION, format!("APIKEY {}", key));

        self.client.json(UPSTREAM, req).await
    }
}

fn decode<T: serde::de::DeserializeOwned>(body: Value) -> Result<T, ClientError> {
    serde_json::from_value(body).map_err(|e| ClientError::Malformed(UPSTREAM, e.to_string()))
}
