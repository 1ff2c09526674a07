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

//! Everything that should raise the dashboard's alert banner for home.

use crate::closings::{ClosingsReport, ClosingsService};
use crate::dwml::{DwmlDocument, WeatherHazard};
use crate::flight::FlightService;
use crate::location::{home_bounds, Airport, HOME};
use crate::nws::NwsService;
use crate::ohgo::OhgoService;
use crate::weather::{crosswind_from_onecall, CrosswindReport, WeatherService};
use chrono::NaiveDate;
use serde::Serialize;
use serde_json::Value;

/// Most incidents included with alerts.
pub const MAX_INCIDENTS: usize = 6;

/// Alerts for the home location. Any source that fails is treated as having nothing to report.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveAlerts {
    pub flight_delays: Option<String>,
    pub ground_stops: Option<Value>,
    pub crosswind: Option<CrosswindReport>,
    pub hazards: Vec<WeatherHazard>,
    pub closings: Option<ClosingsReport>,
    pub incidents: Vec<Value>,
    pub active: bool,
}

impl ActiveAlerts {
    pub fn new(
        flight_delays: Option<String>,
        ground_stops: Option<Value>,
        crosswind: Option<CrosswindReport>,
        hazards: Vec<WeatherHazard>,
        closings: Option<ClosingsReport>,
        incidents: Vec<Value>,
    ) -> Self {
        let flight_delays = flight_delays.filter(|d| !d.trim().is_empty());
        let crosswind = crosswind.filter(|c| c.is_alert());
        let active = flight_delays.is_some()
            || ground_stops.is_some()
            || crosswind.is_some()
            || !hazards.is_empty()
            || closings.is_some()
            || !incidents.is_empty();

        ActiveAlerts {
            flight_delays,
            ground_stops,
            crosswind,
            hazards,
            closings,
            incidents,
            active,
        }
    }
}

/// Incidents from an OHGO response, which lists them under `results`.
pub fn incident_list(body: &Value, limit: usize) -> Vec<Value> {
    body.get("results")
        .or_else(|| body.get("incidents"))
        .and_then(Value::as_array)
        .map(|a| a.iter().take(limit).cloned().collect())
        .unwrap_or_default()
}

/// Services consulted for alerts.
#[derive(Debug, Clone, Copy)]
pub struct AlertSources<'a> {
    pub flight: &'a FlightService,
    pub weather: &'a WeatherService,
    pub nws: &'a NwsService,
    pub closings: &'a ClosingsService,
    pub ohgo: &'a OhgoService,
}

impl<'a> AlertSources<'a> {
    /// Query every source at once for the home location and `airport`.
    pub async fn active_alerts(&self, airport: &Airport, today: NaiveDate) -> ActiveAlerts {
        let (delays, stops, crosswind, hazards, closings, incidents) = tokio::join!(
            self.flight_delays(airport),
            self.ground_stops(airport),
            self.crosswind(airport),
            self.hazards(),
            self.closings.closings(today, false),
            self.incidents(),
        );

        ActiveAlerts::new(delays, stops, crosswind, hazards, closings, incidents)
    }

    async fn flight_delays(&self, airport: &Airport) -> Option<String> {
        self.flight
            .delays(airport.icao)
            .await
            .map_err(|e| tracing::warn!(message = "unable to fetch flight delays for alerts", error = %e))
            .ok()
    }

    async fn ground_stops(&self, airport: &Airport) -> Option<Value> {
        self.flight
            .ground_stops(airport.faa)
            .await
            .map_err(|e| tracing::warn!(message = "unable to fetch ground stops for alerts", error = %e))
            .ok()
            .flatten()
    }

    async fn crosswind(&self, airport: &Airport) -> Option<CrosswindReport> {
        let (lat, lng) = (HOME.lat.to_string(), HOME.lng.to_string());
        let res = self
            .weather
            .onecall(&lat, &lng)
            .await
            .and_then(|v| crosswind_from_onecall(&v, airport.runway_heading));

        res.map_err(|e| tracing::warn!(message = "unable to compute crosswind for alerts", error = %e))
            .ok()
    }

    async fn hazards(&self) -> Vec<WeatherHazard> {
        let (lat, lng) = (HOME.lat.to_string(), HOME.lng.to_string());
        let xml = match self.nws.dwml_forecast(&lat, &lng).await {
            Ok(xml) => xml,
            Err(e) => {
                tracing::warn!(message = "unable to fetch forecast hazards for alerts", error = %e);
                return Vec::new();
            }
        };

        match DwmlDocument::parse(&xml) {
            Ok(doc) => doc.hazards(),
            Err(e) => {
                tracing::warn!(message = "unable to parse forecast hazards for alerts", error = %e);
                Vec::new()
            }
        }
    }

    async fn incidents(&self) -> Vec<Value> {
        match self.ohgo.incidents(&home_bounds()).await {
            Ok(body) => incident_list(&body, MAX_INCIDENTS),
            Err(e) => {
                tracing::warn!(message = "unable to fetch incidents for alerts", error = %e);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{incident_list, ActiveAlerts, AlertSources};
    use crate::client::tests::test_client;
    use crate::client::Endpoints;
    use crate::closings::ClosingsService;
    use crate::flight::FlightService;
    use crate::location::KCLE;
    use crate::nws::NwsService;
    use crate::ohgo::OhgoService;
    use crate::secrets::tests::test_secrets;
    use crate::weather::{CrosswindReport, WeatherService};
    use chrono::NaiveDate;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const FORECAST: &str = include_str!("../../testdata/digital_dwml.xml");

    #[test]
    fn test_nothing_active() {
        let quiet = CrosswindReport {
            alert_start: None,
            max: None,
        };
        let alerts = ActiveAlerts::new(Some("  ".to_owned()), None, Some(quiet), vec![], None, vec![]);

        assert!(!alerts.active);
        assert_eq!(None, alerts.flight_delays);
        assert_eq!(None, alerts.crosswind);
    }

    #[test]
    fn test_any_source_active() {
        let alerts = ActiveAlerts::new(None, Some(json!([{"Reason": "weather"}])), None, vec![], None, vec![]);
        assert!(alerts.active);

        let alerts = ActiveAlerts::new(None, None, None, vec![], None, vec![json!({"id": "1"})]);
        assert!(alerts.active);
    }

    #[test]
    fn test_incident_list() {
        let body = json!({"results": (0..10).map(|i| json!({"id": i})).collect::<Vec<_>>()});
        assert_eq!(6, incident_list(&body, 6).len());
        assert_eq!(json!({"id": 0}), incident_list(&body, 6)[0]);

        assert!(incident_list(&json!({"totalResultCount": 0}), 6).is_empty());
    }

    #[tokio::test]
    async fn test_active_alerts() {
        let server = MockServer::start().await;
        let endpoints = Endpoints::mock(&server.uri());

        Mock::given(method("GET"))
            .and(path("/aeroapi/airports/delays"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "delays": [{"airport": "KCLE", "reasons": [{"reason": "Weather / Snow"}]}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/faa/airport/status/cle"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/onecall"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "hourly": [{"dt": 1705363200, "wind_speed": 5.0, "wind_deg": 60}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/MapClick.php"))
            .respond_with(ResponseTemplate::new(200).set_body_string(FORECAST))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/ohgo/incidents"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": []})))
            .mount(&server)
            .await;

        let client = test_client();
        let secrets = test_secrets();
        let flight = FlightService::new(client.clone(), secrets.clone(), &endpoints.aeroapi, &endpoints.faa);
        let weather = WeatherService::new(
            client.clone(),
            secrets.clone(),
            &endpoints.openweathermap,
            &endpoints.ambient_weather,
            &endpoints.geocode,
        );
        let nws = NwsService::new(client.clone(), &endpoints.ndfd, &endpoints.dwml, &endpoints.open_meteo_gfs);
        let closings = ClosingsService::new(
            client.clone(),
            secrets.clone(),
            &endpoints.spectrum_closings,
            &endpoints.fox8_closings,
            &endpoints.vertex,
        );
        let ohgo = OhgoService::new(client, secrets, &endpoints.ohgo);

        let sources = AlertSources {
            flight: &flight,
            weather: &weather,
            nws: &nws,
            closings: &closings,
            ohgo: &ohgo,
        };
        let summer = NaiveDate::from_ymd_opt(2024, 7, 4).unwrap();
        let alerts = sources.active_alerts(&KCLE, summer).await;

        assert!(alerts.active);
        assert_eq!(Some("Weather / Snow".to_owned()), alerts.flight_delays);
        assert_eq!(None, alerts.ground_stops);
        assert_eq!(None, alerts.crosswind);
        assert_eq!(2, alerts.hazards.len());
        assert_eq!(None, alerts.closings);
        assert!(alerts.incidents.is_empty());
    }
}
