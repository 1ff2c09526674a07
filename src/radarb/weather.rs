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

use crate::client::{url_with_params, ClientError, UpstreamClient};
use crate::secrets::{Secret, SecretCache};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

const OWM_UPSTREAM: &str = "openweathermap";
const AMBIENT_UPSTREAM: &str = "ambient_weather";
const GEOCODE_UPSTREAM: &str = "geocode";

/// Crosswind, in mph, at or above which landing on the runway is reported.
pub const CROSSWIND_THRESHOLD_MPH: f64 = 20.0;

/// Wind for one hour of an OpenWeatherMap One Call forecast.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct HourlyWind {
    pub dt: i64,
    #[serde(default)]
    pub wind_speed: f64,
    #[serde(default)]
    pub wind_deg: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct OneCallHourly {
    #[serde(default)]
    hourly: Vec<HourlyWind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CrosswindHour {
    pub dt: i64,
    pub crosswind: f64,
    pub wind_speed: f64,
    pub wind_deg: f64,
}

/// When crosswinds first reach the threshold and the hour they are strongest.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CrosswindReport {
    pub alert_start: Option<i64>,
    pub max: Option<CrosswindHour>,
}

impl CrosswindReport {
    pub fn is_alert(&self) -> bool {
        self.alert_start.is_some()
    }
}

/// Component of the wind perpendicular to a runway, in the wind's units.
///
/// The runway is used in whichever direction is closer to the wind direction.
pub fn crosswind(wind_speed: f64, wind_deg: f64, runway_heading: f64) -> f64 {
    let reciprocal = (runway_heading + 180.0) % 360.0;
    let heading = if (wind_deg - runway_heading).abs() <= (wind_deg - reciprocal).abs() {
        runway_heading
    } else {
        reciprocal
    };

    wind_speed * (wind_deg - heading).to_radians().sin()
}

pub fn crosswind_report(hours: &[HourlyWind], runway_heading: f64, threshold: f64) -> CrosswindReport {
    let mut alert_start = None;
    let mut max: Option<CrosswindHour> = None;

    for h in hours {
        let c = crosswind(h.wind_speed, h.wind_deg, runway_heading);
        if alert_start.is_none() && c.abs() >= threshold {
            alert_start = Some(h.dt);
        }

        if c.abs() > max.map(|m| m.crosswind.abs()).unwrap_or(0.0) {
            max = Some(CrosswindHour {
                dt: h.dt,
                crosswind: c,
                wind_speed: h.wind_speed,
                wind_deg: h.wind_deg,
            });
        }
    }

    CrosswindReport { alert_start, max }
}

/// Crosswind report from the hourly section of a One Call response.
pub fn crosswind_from_onecall(onecall: &Value, runway_heading: f64) -> Result<CrosswindReport, ClientError> {
    let parsed: OneCallHourly =
        serde_json::from_value(onecall.clone()).map_err(|e| ClientError::Malformed(OWM_UPSTREAM, e.to_string()))?;
    Ok(crosswind_report(&parsed.hourly, runway_heading, CROSSWIND_THRESHOLD_MPH))
}

/// Address of a location from Google reverse geocoding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CityName {
    pub address: String,
    #[serde(rename = "premiseType")]
    pub premise_type: Option<String>,
    pub address_components: Value,
}

#[derive(Debug, Deserialize)]
struct GeocodeResponse {
    #[serde(default)]
    results: Vec<GeocodeResult>,
}

#[derive(Debug, Deserialize)]
struct GeocodeResult {
    #[serde(default)]
    formatted_address: String,
    #[serde(default)]
    types: Vec<String>,
    #[serde(default)]
    address_components: Value,
}

/// Current conditions and forecasts from OpenWeatherMap, Ambient Weather, and Google.
#[derive(Debug)]
pub struct WeatherService {
    client: UpstreamClient,
    secrets: Arc<SecretCache>,
    onecall_url: String,
    ambient_url: String,
    geocode_url: String,
}

impl WeatherService {
    pub fn new(
        client: UpstreamClient,
        secrets: Arc<SecretCache>,
        onecall_url: &str,
        ambient_url: &str,
        geocode_url: &str,
    ) -> Self {
        WeatherService {
            client,
            secrets,
            onecall_url: onecall_url.to_owned(),
            ambient_url: ambient_url.to_owned(),
            geocode_url: geocode_url.to_owned(),
        }
    }

    /// One Call 3.0 forecast in imperial units without the minutely section.
    pub async fn onecall(&self, lat: &str, lng: &str) -> Result<Value, ClientError> {
        let key = self.secrets.get(Secret::OpenWeatherMap).await?;
        let url = url_with_params(
            &self.onecall_url,
            &[
                ("lat", lat),
                ("lon", lng),
                ("exclude", "minutely"),
                ("units", "imperial"),
                ("appid", &key),
            ],
        )?;

        self.client.json(OWM_UPSTREAM, self.client.http().get(url)).await
    }

    /// Latest readings from every Ambient Weather station on the account.
    pub async fn ambient(&self) -> Result<Value, ClientError> {
        let application_key = self.secrets.get(Secret::AmbientApplicationKey).await?;
        let api_key = self.secrets.get(Secret::AmbientApiKey).await?;
        let url = url_with_params(
            &self.ambient_url,
            &[("applicationKey", &application_key), ("apiKey", &api_key)],
        )?;

        self.client.json(AMBIENT_UPSTREAM, self.client.http().get(url)).await
    }

    /// Address of the first reverse geocoding result, `None` when there are no results.
    pub async fn city_name(&self, lat: &str, lng: &str) -> Result<Option<CityName>, ClientError> {
        let key = self.secrets.get(Secret::GoogleMaps).await?;
        let latlng = format!("{},{}", lat, lng);
        let url = url_with_params(&self.geocode_url, &[("latlng", &latlng), ("key", &key)])?;

        let res: GeocodeResponse = self.client.json(GEOCODE_UPSTREAM, self.client.http().get(url)).await?;
        Ok(res.results.into_iter().next().map(|r| CityName {
            address: r.formatted_address,
            premise_type: r.types.into_iter().next(),
            address_components: r.address_components,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::{crosswind, crosswind_from_onecall, crosswind_report, HourlyWind, WeatherService, CROSSWIND_THRESHOLD_MPH};
    use crate::client::tests::test_client;
    use crate::secrets::tests::test_secrets;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const RUNWAY: f64 = 58.1;

    fn hour(dt: i64, wind_speed: f64, wind_deg: f64) -> HourlyWind {
        HourlyWind {
            dt,
            wind_speed,
            wind_deg,
        }
    }

    fn service(server: &MockServer) -> WeatherService {
        let base = server.uri();
        WeatherService::new(
            test_client(),
            test_secrets(),
            &format!("{}/onecall", base),
            &format!("{}/devices", base),
            &format!("{}/geocode/json", base),
        )
    }

    #[test]
    fn test_crosswind_aligned_with_runway() {
        assert!(crosswind(30.0, RUNWAY, RUNWAY).abs() < 1e-9);
        assert!(crosswind(30.0, 238.1, RUNWAY).abs() < 1e-9);
    }

    #[test]
    fn test_crosswind_perpendicular() {
        assert!((crosswind(25.0, 148.1, RUNWAY) - 25.0).abs() < 1e-9);
        assert!((crosswind(25.0, 328.1, RUNWAY) - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_crosswind_uses_closer_direction() {
        // 200 degrees is closer to 238.1 than to 58.1
        let expected = 20.0 * (200.0_f64 - 238.1).to_radians().sin();
        assert!((crosswind(20.0, 200.0, RUNWAY) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_crosswind_report_alert() {
        let hours = vec![
            hour(1000, 10.0, 148.1),
            hour(2000, 22.0, 148.1),
            hour(3000, 30.0, 148.1),
            hour(4000, 5.0, 148.1),
        ];

        let report = crosswind_report(&hours, RUNWAY, CROSSWIND_THRESHOLD_MPH);

        assert!(report.is_alert());
        assert_eq!(Some(2000), report.alert_start);
        assert_eq!(Some(3000), report.max.map(|m| m.dt));
    }

    #[test]
    fn test_crosswind_report_no_alert() {
        let hours = vec![hour(1000, 10.0, 148.1), hour(2000, 12.0, 100.0)];
        let report = crosswind_report(&hours, RUNWAY, CROSSWIND_THRESHOLD_MPH);

        assert!(!report.is_alert());
        assert_eq!(Some(1000), report.max.map(|m| m.dt));
    }

    #[test]
    fn test_crosswind_report_empty() {
        let report = crosswind_report(&[], RUNWAY, CROSSWIND_THRESHOLD_MPH);
        assert_eq!(None, report.alert_start);
        assert_eq!(None, report.max);
    }

    #[test]
    fn test_crosswind_from_onecall() {
        let onecall = json!({
            "lat": 41.48,
            "lon": -81.81,
            "current": {"dt": 1000, "temp": 30.2},
            "hourly": [{"dt": 1000, "temp": 30.2, "wind_speed": 24.0, "wind_deg": 330}]
        });

        let report = crosswind_from_onecall(&onecall, RUNWAY).unwrap();
        assert_eq!(Some(1000), report.alert_start);
    }

    #[tokio::test]
    async fn test_onecall() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/onecall"))
            .and(query_param("lat", "41.48"))
            .and(query_param("lon", "-81.81"))
            .and(query_param("exclude", "minutely"))
            .and(query_param("units", "imperial"))
            .and(query_param("appid", "value-for-openweathermap"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"timezone": "America/New_York"})))
            .expect(1)
            .mount(&server)
            .await;

        let res = service(&server).onecall("41.48", "-81.81").await.unwrap();
        assert_eq!(json!({"timezone": "America/New_York"}), res);
    }

    #[tokio::test]
    async fn test_ambient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/devices"))
            .and(query_param("applicationKey", "value-for-ambient-weather-application-key"))
            .and(query_param("apiKey", "value-for-ambient-weather-api-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"macAddress": "00:0E:C6:20:0F:7B"}])))
            .expect(1)
            .mount(&server)
            .await;

        let res = service(&server).ambient().await.unwrap();
        assert_eq!(json!([{"macAddress": "00:0E:C6:20:0F:7B"}]), res);
    }

    #[tokio::test]
    async fn test_city_name() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/geocode/json"))
            .and(query_param("latlng", "41.48,-81.81"))
            .and(query_param("key", "value-for-google-maps-api"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{
                    "formatted_address": "14701 Detroit Ave, Lakewood, OH 44107, USA",
                    "types": ["street_address"],
                    "address_components": [{"long_name": "Lakewood", "types": ["locality"]}]
                }],
                "status": "OK"
            })))
            .mount(&server)
            .await;

        let city = service(&server).city_name("41.48", "-81.81").await.unwrap().unwrap();

        assert_eq!("14701 Detroit Ave, Lakewood, OH 44107, USA", city.address);
        assert_eq!(Some("street_address".to_owned()), city.premise_type);
        assert_eq!(json!([{"long_name": "Lakewood", "types": ["locality"]}]), city.address_components);
    }

    #[tokio::test]
    async fn test_city_name_no_results() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/geocode/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": [], "status": "ZERO_RESULTS"})))
            .mount(&server)
            .await;

        assert_eq!(None, service(&server).city_name("0", "0").await.unwrap());
    }
}
