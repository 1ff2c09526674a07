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

use crate::metrics::ProxyMetrics;
use crate::secrets::SecretError;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use thiserror::Error;

/// User agent sent to APIs that identify their callers.
pub const USER_AGENT: &str = "radarb (https://github.com/56quarters/radarb)";

/// User agent sent to sites that only serve browsers.
pub const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{0}")]
    Internal(#[from] reqwest::Error),
    #[error("unexpected status {0} for {1}")]
    Unexpected(StatusCode, Url),
    #[error("invalid URL {0}: {1}")]
    InvalidUrl(String, String),
    #[error("malformed response from {0}: {1}")]
    Malformed(&'static str, String),
    #[error("{0}")]
    Secret(#[from] SecretError),
}

/// Base URLs of every upstream API.
///
/// Defaults point at the production services. Each URL that has paths joined onto it
/// ends with a `/`.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub ohgo: String,
    pub aeroapi: String,
    pub faa: String,
    pub geocode: String,
    pub openweathermap: String,
    pub ambient_weather: String,
    pub ndfd: String,
    pub dwml: String,
    pub sunrise_sunset: String,
    pub open_meteo_gfs: String,
    pub spectrum_closings: String,
    pub fox8_closings: String,
    pub vertex: String,
    pub pivotal: String,
    pub secret_manager: String,
    pub firestore: String,
    pub metadata_token: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Endpoints {
            ohgo: "https://publicapi.ohgo.com/api/v1/".to_owned(),
            aeroapi: "https://aeroapi.flightaware.com/aeroapi/".to_owned(),
            faa: "https://soa.smext.faa.gov/asws/api/".to_owned(),
            geocode: "https://maps.googleapis.com/maps/api/geocode/json".to_owned(),
            openweathermap: "https://api.openweathermap.org/data/3.0/onecall".to_owned(),
            ambient_weather: "https://api.ambientweather.net/v1/devices".to_owned(),
            ndfd: "https://digital.weather.gov/xml/sample_products/browser_interface/ndfdXMLclient.php".to_owned(),
            dwml: "https://forecast.weather.gov/MapClick.php".to_owned(),
            sunrise_sunset: "https://api.sunrise-sunset.org/json".to_owned(),
            open_meteo_gfs: "https://api.open-meteo.com/v1/gfs".to_owned(),
            spectrum_closings: "https://spectrumnews1.com/services/closings.5b68bed4850bba13eeb29507.json".to_owned(),
            fox8_closings: "https://fox8.com/weather/closings/".to_owned(),
            vertex: "https://us-central1-aiplatform.googleapis.com/v1/projects/358874041676/locations/us-central1/publishers/google/models/gemini-2.0-flash:generateContent".to_owned(),
            pivotal: "https://www.pivotalweather.com/model.php?m=hrrr&p=qpf_006h-imp&fh=0&r=us_ma&dpdt=&mc=".to_owned(),
            secret_manager: "https://secretmanager.googleapis.com/v1/".to_owned(),
            firestore: "https://firestore.googleapis.com/v1/".to_owned(),
            metadata_token: "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token"
                .to_owned(),
        }
    }
}

impl Endpoints {
    /// Every upstream served from a distinct path of a single mock server.
    #[cfg(test)]
    pub fn mock(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Endpoints {
            ohgo: format!("{}/ohgo/", base),
            aeroapi: format!("{}/aeroapi/", base),
            faa: format!("{}/faa/", base),
            geocode: format!("{}/geocode/json", base),
            openweathermap: format!("{}/onecall", base),
            ambient_weather: format!("{}/devices", base),
            ndfd: format!("{}/ndfdXMLclient.php", base),
            dwml: format!("{}/MapClick.php", base),
            sunrise_sunset: format!("{}/sunrise-sunset/json", base),
            open_meteo_gfs: format!("{}/gfs", base),
            spectrum_closings: format!("{}/closings.json", base),
            fox8_closings: format!("{}/weather/closings/", base),
            vertex: format!("{}/gemini:generateContent", base),
            pivotal: format!("{}/model.php", base),
            secret_manager: format!("{}/secretmanager/", base),
            firestore: format!("{}/firestore/", base),
            metadata_token: format!("{}/token", base),
        }
    }
}

/// Parse `base` and append `params` as query pairs.
pub fn url_with_params(base: &str, params: &[(&str, &str)]) -> Result<Url, ClientError> {
    let mut url = Url::parse(base).map_err(|e| ClientError::InvalidUrl(base.to_owned(), e.to_string()))?;
    if !params.is_empty() {
        url.query_pairs_mut().extend_pairs(params);
    }

    Ok(url)
}

/// Resolve `path` relative to `base`, which must end with a `/`.
pub fn join_url(base: &str, path: &str) -> Result<Url, ClientError> {
    Url::parse(base)
        .and_then(|u| u.join(path))
        .map_err(|e| ClientError::InvalidUrl(format!("{}{}", base, path), e.to_string()))
}

/// Shared HTTP client for all upstream APIs that records the outcome of each call.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: Client,
    metrics: ProxyMetrics,
}

impl UpstreamClient {
    pub fn new(client: Client, metrics: ProxyMetrics) -> Self {
        UpstreamClient { client, metrics }
    }

    pub fn http(&self) -> &Client {
        &self.client
    }

    pub fn metrics(&self) -> &ProxyMetrics {
        &self.metrics
    }

    /// Send a request, accepting any successful status or `304 Not Modified`.
    pub async fn send(&self, upstream: &'static str, req: RequestBuilder) -> Result<Response, ClientError> {
        let res = req.send().await.map_err(|e| {
            self.metrics.upstream_request(upstream, false);
            ClientError::Internal(e)
        })?;

        let status = res.status();
        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            self.metrics.upstream_request(upstream, true);
            Ok(res)
        } else {
            self.metrics.upstream_request(upstream, false);
            Err(ClientError::Unexpected(status, res.url().clone()))
        }
    }

    pub async fn json<T: DeserializeOwned>(&self, upstream: &'static str, req: RequestBuilder) -> Result<T, ClientError> {
        let res = self.send(upstream, req).await?;
        Ok(res.json::<T>().await?)
    }

    pub async fn text(&self, upstream: &'static str, req: RequestBuilder) -> Result<String, ClientError> {
        let res = self.send(upstream, req).await?;
        Ok(res.text().await?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::{join_url, url_with_params, ClientError, UpstreamClient};
    use crate::metrics::ProxyMetrics;
    use prometheus_client::registry::Registry;
    use reqwest::{Client, StatusCode};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    pub(crate) fn test_client() -> UpstreamClient {
        let mut registry = Registry::default();
        UpstreamClient::new(Client::new(), ProxyMetrics::new(&mut registry))
    }

    #[test]
    fn test_url_with_params() {
        let url = url_with_params("https://example.com/api", &[("lat", "41.48"), ("lon", "-81.81")]).unwrap();
        assert_eq!("https://example.com/api?lat=41.48&lon=-81.81", url.as_str());
    }

    #[test]
    fn test_url_with_params_invalid() {
        let res = url_with_params("not a url", &[]);
        assert!(matches!(res, Err(ClientError::InvalidUrl(_, _))));
    }

    #[test]
    fn test_join_url() {
        let url = join_url("https://soa.smext.faa.gov/asws/api/", "airport/status/cle").unwrap();
        assert_eq!("https://soa.smext.faa.gov/asws/api/airport/status/cle", url.as_str());
    }

    #[tokio::test]
    async fn test_send_unexpected_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/broken"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = test_client();
        let req = client.http().get(format!("{}/broken", server.uri()));
        let res = client.text("test", req).await;

        match res {
            Err(ClientError::Unexpected(status, _)) => assert_eq!(StatusCode::SERVICE_UNAVAILABLE, status),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_accepts_not_modified() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cached"))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;

        let client = test_client();
        let req = client.http().get(format!("{}/cached", server.uri()));
        let res = client.send("test", req).await.unwrap();

        assert_eq!(StatusCode::NOT_MODIFIED, res.status());
    }

    #[tokio::test]
    async fn test_json() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"results": [1, 2]})))
            .mount(&server)
            .await;

        let client = test_client();
        let req = client.http().get(format!("{}/data", server.uri()));
        let body: serde_json::Value = client.json("test", req).await.unwrap();

        assert_eq!(serde_json::json!({"results": [1, 2]}), body);
    }
}
