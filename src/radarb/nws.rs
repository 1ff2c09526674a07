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

use crate::cache::{CacheKey, Lookup, TtlCache};
use crate::client::{url_with_params, ClientError, UpstreamClient, USER_AGENT};
use crate::dwml::{DwmlDocument, DwmlError};
use crate::meteogram::{Meteogram, MeteogramError, OpenMeteoSnowfall, SnowTail};
use reqwest::header::{ETAG, IF_NONE_MATCH, USER_AGENT as USER_AGENT_HEADER};
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;

const NDFD_UPSTREAM: &str = "ndfd";
const DWML_UPSTREAM: &str = "dwml";
const GFS_UPSTREAM: &str = "open-meteo";
const SNOW_TAIL_DAYS: &str = "7";

pub const NDFD_SNOW_TTL: Duration = Duration::from_secs(60 * 60);
pub const SNOW_TAIL_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Error)]
pub enum ForecastError {
    #[error("{0}")]
    Client(#[from] ClientError),
    #[error("{0}")]
    Dwml(#[from] DwmlError),
    #[error("{0}")]
    Meteogram(#[from] MeteogramError),
}

/// Forecasts from the National Weather Service and the GFS model.
#[derive(Debug)]
pub struct NwsService {
    client: UpstreamClient,
    ndfd_url: String,
    dwml_url: String,
    gfs_url: String,
    snow: TtlCache<String>,
    forecast: TtlCache<String>,
    tail: TtlCache<SnowTail>,
}

impl NwsService {
    pub fn new(client: UpstreamClient, ndfd_url: &str, dwml_url: &str, gfs_url: &str) -> Self {
        NwsService {
            client,
            ndfd_url: ndfd_url.to_owned(),
            dwml_url: dwml_url.to_owned(),
            gfs_url: gfs_url.to_owned(),
            snow: TtlCache::new(NDFD_SNOW_TTL),
            forecast: TtlCache::revalidating(),
            tail: TtlCache::new(SNOW_TAIL_TTL),
        }
    }

    /// NDFD time-series snow amounts as raw DWML, cached for an hour per location.
    pub async fn ndfd_snow(&self, lat: &str, lng: &str) -> Result<String, ClientError> {
        let key = CacheKey::from_parts([lat, lng]);
        let (xml, lookup) = self
            .snow
            .get_or_fetch(&key, || async {
                let url = url_with_params(
                    &self.ndfd_url,
                    &[("lat", lat), ("lon", lng), ("product", "time-series"), ("snow", "1")],
                )?;
                tracing::debug!(message = "making NDFD snow request", url = %url);

                let req = self.client.http().get(url).header(USER_AGENT_HEADER, USER_AGENT);
                self.client.text(NDFD_UPSTREAM, req).await
            })
            .await?;

        self.client.metrics().cache_lookup("ndfd_snow", lookup);
        Ok(xml)
    }

    /// Digital DWML forecast, revalidated against the upstream `ETag` on every call.
    pub async fn dwml_forecast(&self, lat: &str, lng: &str) -> Result<String, ClientError> {
        let key = CacheKey::from_parts([lat, lng]);
        let cached = self.forecast.get(&key);
        let url = url_with_params(&self.dwml_url, &[("lat", lat), ("lon", lng), ("FcstType", "digitalDWML")])?;
        tracing::debug!(message = "making DWML forecast request", url = %url);

        let mut req = self.client.http().get(url.clone()).header(USER_AGENT_HEADER, USER_AGENT);
        if let Some(etag) = cached.as_ref().and_then(|c| c.etag.as_deref()) {
            req = req.header(IF_NONE_MATCH, etag);
        }

        let res = self.client.send(DWML_UPSTREAM, req).await?;
        if res.status() == StatusCode::NOT_MODIFIED {
            return match cached {
                Some(entry) => {
                    self.client.metrics().cache_lookup("dwml_forecast", Lookup::Hit);
                    Ok(entry.value)
                }
                None => Err(ClientError::Unexpected(StatusCode::NOT_MODIFIED, url)),
            };
        }

        let etag = res
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_owned);
        let xml = res.text().await?;

        self.client.metrics().cache_lookup("dwml_forecast", Lookup::Miss);
        self.forecast.insert_with_etag(key, xml.clone(), etag);
        Ok(xml)
    }

    /// Accumulated GFS snowfall for the next week, cached for 30 minutes per location.
    pub async fn snow_tail(&self, lat: &str, lng: &str) -> Result<SnowTail, ClientError> {
        let key = CacheKey::from_parts([lat, lng]);
        let (tail, lookup) = self
            .tail
            .get_or_fetch(&key, || async {
                let url = url_with_params(
                    &self.gfs_url,
                    &[
                        ("latitude", lat),
                        ("longitude", lng),
                        ("hourly", "snowfall"),
                        ("timezone", "UTC"),
                        ("forecast_days", SNOW_TAIL_DAYS),
                    ],
                )?;

                let res: OpenMeteoSnowfall = self.client.json(GFS_UPSTREAM, self.client.http().get(url)).await?;
                SnowTail::from_open_meteo(&res).map_err(|e| ClientError::Malformed(GFS_UPSTREAM, e.to_string()))
            })
            .await?;

        self.client.metrics().cache_lookup("snow_tail", lookup);
        Ok(tail)
    }

    /// Forecast aligned to an hourly timeline, with snow accumulation when available.
    ///
    /// Only the digital forecast is required. Snow amounts and the GFS extension of
    /// them are added when they can be fetched.
    pub async fn meteogram(&self, lat: &str, lng: &str) -> Result<Meteogram, ForecastError> {
        let forecast_xml = self.dwml_forecast(lat, lng).await?;
        let snow_xml = match self.ndfd_snow(lat, lng).await {
            Ok(xml) => Some(xml),
            Err(e) => {
                tracing::warn!(message = "unable to fetch NDFD snow, continuing without it", error = %e);
                None
            }
        };

        let forecast = DwmlDocument::parse(&forecast_xml)?;
        let snow = snow_xml.as_deref().and_then(|xml| match DwmlDocument::parse(xml) {
            Ok(doc) => Some(doc),
            Err(e) => {
                tracing::warn!(message = "unable to parse NDFD snow, continuing without it", error = %e);
                None
            }
        });

        let mut meteogram = Meteogram::build(&forecast, snow.as_ref())?;
        if meteogram.snow_ends_early() {
            match self.snow_tail(lat, lng).await {
                Ok(tail) => meteogram.extend_snow(&tail),
                Err(e) => tracing::warn!(message = "unable to fetch GFS snow tail", error = %e),
            }
        }

        Ok(meteogram)
    }
}
