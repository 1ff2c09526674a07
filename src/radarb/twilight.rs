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
use crate::client::{url_with_params, ClientError, UpstreamClient};
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

const UPSTREAM: &str = "sunrise-sunset";

pub const TWILIGHT_TTL: Duration = Duration::from_secs(6 * 60 * 60);
pub const DEFAULT_TIME_ZONE: &str = "America/New_York";

#[derive(Debug, Error)]
pub enum TwilightError {
    #[error("{0}")]
    Client(#[from] ClientError),
    #[error("unknown time zone {0}")]
    UnknownTimeZone(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct SunriseSunset {
    pub results: Option<SolarTimes>,
    #[serde(default)]
    pub status: String,
}

/// Solar event times for one day, in UTC.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SolarTimes {
    pub civil_twilight_begin: DateTime<Utc>,
    pub civil_twilight_end: DateTime<Utc>,
    pub sunrise: Option<DateTime<Utc>>,
    pub sunset: Option<DateTime<Utc>>,
}

/// Twilight and sun times as local wall-clock times, e.g. `05:32 PM`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TwilightTimes {
    pub dawn: String,
    pub dusk: String,
    pub sunrise: String,
    pub sunset: String,
    pub date: String,
    pub tz: String,
}

impl TwilightTimes {
    pub fn from_solar(times: &SolarTimes, tz: Tz) -> Self {
        let local = |t: &DateTime<Utc>| t.with_timezone(&tz).format("%I:%M %p").to_string();
        TwilightTimes {
            dawn: local(&times.civil_twilight_begin),
            dusk: local(&times.civil_twilight_end),
            sunrise: times.sunrise.as_ref().map(local).unwrap_or_default(),
            sunset: times.sunset.as_ref().map(local).unwrap_or_default(),
            date: times
                .civil_twilight_begin
                .with_timezone(&tz)
                .format("%Y-%m-%d")
                .to_string(),
            tz: tz.name().to_owned(),
        }
    }
}

/// Client for the sunrise-sunset.org API.
#[derive(Debug)]
pub struct TwilightService {
    client: UpstreamClient,
    url: String,
    cache: TtlCache<TwilightTimes>,
}

impl TwilightService {
    pub fn new(client: UpstreamClient, url: &str) -> Self {
        TwilightService {
            client,
            url: url.to_owned(),
            cache: TtlCache::new(TWILIGHT_TTL),
        }
    }

    /// Solar times at a location for `date`, or today when `date` is `None`.
    pub async fn solar_times(&self, lat: &str, lng: &str, date: Option<NaiveDate>) -> Result<SolarTimes, ClientError> {
        let date = date.map(|d| d.format("%Y-%m-%d").to_string());
        let mut params = vec![("lat", lat), ("lng", lng), ("formatted", "0")];
        if let Some(d) = date.as_deref() {
            params.push(("date", d));
        }

        let url = url_with_params(&self.url, &params)?;
        tracing::debug!(message = "making twilight request", url = %url);

        let res: SunriseSunset = self.client.json(UPSTREAM, self.client.http().get(url)).await?;
        res.results
            .ok_or_else(|| ClientError::Malformed(UPSTREAM, format!("missing results, status {:?}", res.status)))
    }

    /// Today's twilight times in the time zone named `tz`, cached for six hours.
    pub async fn times(&self, lat: &str, lng: &str, tz: &str) -> Result<TwilightTimes, TwilightError> {
        let zone: Tz = tz.parse().map_err(|_| TwilightError::UnknownTimeZone(tz.to_owned()))?;
        let key = CacheKey::from_parts([lat, lng, tz]);
        let (times, lookup) = self
            .cache
            .get_or_fetch(&key, || async {
                let solar = self.solar_times(lat, lng, None).await?;
                Ok::<_, ClientError>(TwilightTimes::from_solar(&solar, zone))
            })
            .await?;

        self.client.metrics().cache_lookup("twilight", lookup);
        Ok(times)
    }
}
