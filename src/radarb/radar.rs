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

//! Radar imagery: an allow-listed image proxy and the Pivotal Weather HRRR page.

use crate::client::{ClientError, UpstreamClient, BROWSER_USER_AGENT};
use percent_encoding::percent_decode_str;
use reqwest::header::{ACCEPT, CONTENT_TYPE, USER_AGENT};
use reqwest::Url;
use scraper::{Html, Selector};
use serde::Serialize;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

const RADAR_UPSTREAM: &str = "radar";
const PIVOTAL_UPSTREAM: &str = "pivotal";
const IMAGE_ACCEPT: &str = "image/avif,image/webp,image/apng,image/*,*/*;q=0.8";
const DEFAULT_CONTENT_TYPE: &str = "image/gif";
const CACHE_BUSTER: &str = "t";
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_ALLOWED_HOST: &str = "sirocco.accuweather.com";
pub const DEFAULT_CACHE_SECS: u64 = 180;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RadarUrlError {
    #[error("url is required")]
    Missing,
    #[error("host not allowed")]
    HostNotAllowed,
    #[error("invalid url")]
    Invalid,
}

#[derive(Debug, Clone)]
pub struct RadarConfig {
    allowed_hosts: HashSet<String>,
    cache_secs: u64,
}

impl RadarConfig {
    pub fn new<I, S>(allowed_hosts: I, cache_secs: u64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let allowed_hosts = allowed_hosts
            .into_iter()
            .map(|h| h.as_ref().trim().to_owned())
            .filter(|h| !h.is_empty())
            .collect();

        RadarConfig {
            allowed_hosts,
            cache_secs,
        }
    }

    pub fn is_allowed(&self, host: &str) -> bool {
        self.allowed_hosts.contains(host)
    }

    /// Value of the `Cache-Control` header sent with proxied images.
    pub fn cache_control(&self) -> String {
        format!("public, max-age={}", self.cache_secs)
    }
}

impl Default for RadarConfig {
    fn default() -> Self {
        Self::new([DEFAULT_ALLOWED_HOST], DEFAULT_CACHE_SECS)
    }
}

/// Decode a requested radar URL, check its host, and drop the `t` cache-buster.
pub fn sanitize_radar_url(raw: Option<&str>, config: &RadarConfig) -> Result<Url, RadarUrlError> {
    let raw = raw.filter(|r| !r.is_empty()).ok_or(RadarUrlError::Missing)?;
    let decoded = percent_decode_str(raw).decode_utf8_lossy();
    let mut url = Url::parse(&decoded).map_err(|_| RadarUrlError::Invalid)?;

    if !url.host_str().map(|h| config.is_allowed(h)).unwrap_or(false) {
        return Err(RadarUrlError::HostNotAllowed);
    }

    let kept = url
        .query_pairs()
        .filter(|(k, _)| k != CACHE_BUSTER)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect::<Vec<_>>();

    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }

    Ok(url)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadarImage {
    pub content_type: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PivotalImage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

/// `src` of the `#display_image` element on a Pivotal Weather model page.
pub fn display_image_src(page: &str) -> Result<Option<String>, ClientError> {
    let selector =
        Selector::parse("#display_image").map_err(|e| ClientError::Malformed(PIVOTAL_UPSTREAM, e.to_string()))?;
    let doc = Html::parse_document(page);

    Ok(doc
        .select(&selector)
        .next()
        .and_then(|el| el.value().attr("src"))
        .map(|s| s.to_owned()))
}

#[derive(Debug)]
pub struct RadarService {
    client: UpstreamClient,
    config: RadarConfig,
    pivotal_url: String,
}

impl RadarService {
    pub fn new(client: UpstreamClient, config: RadarConfig, pivotal_url: &str) -> Self {
        RadarService {
            client,
            config,
            pivotal_url: pivotal_url.to_owned(),
        }
    }

    pub fn config(&self) -> &RadarConfig {
        &self.config
    }

    /// Fetch an image from an allow-listed host as a browser would.
    pub async fn image(&self, url: Url) -> Result<RadarImage, ClientError> {
        tracing::debug!(message = "making radar image request", url = %url);

        let req = self
            .client
            .http()
            .get(url)
            .timeout(FETCH_TIMEOUT)
            .header(ACCEPT, IMAGE_ACCEPT)
            .header(USER_AGENT, BROWSER_USER_AGENT);

        let res = self.client.send(RADAR_UPSTREAM, req).await?;
        let content_type = res
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_owned();

        let body = res.bytes().await?.to_vec();
        Ok(RadarImage { content_type, body })
    }

    /// Current HRRR 6 hour QPF image from Pivotal Weather.
    pub async fn pivotal_hrrr_qpf(&self) -> Result<PivotalImage, ClientError> {
        let page = self
            .client
            .text(PIVOTAL_UPSTREAM, self.client.http().get(&self.pivotal_url))
            .await?;

        Ok(PivotalImage {
            image_url: display_image_src(&page)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{display_image_src, sanitize_radar_url, RadarConfig, RadarService, RadarUrlError};
    use crate::client::tests::test_client;
    use wiremock::matchers::{headers, method, path, query_param, query_param_is_missing};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const RADAR_GIF: &str = "https://sirocco.accuweather.com/nx_mosaic_640x480_public/sir/inmsiroh_.gif";

    #[test]
    fn test_sanitize_strips_cache_buster() {
        let raw = "https%3A%2F%2Fsirocco.accuweather.com%2Fnx_mosaic_640x480_public%2Fsir%2Finmsiroh_.gif%3Ft%3D12345";
        let url = sanitize_radar_url(Some(raw), &RadarConfig::default()).unwrap();
        assert_eq!(RADAR_GIF, url.as_str());
    }

    #[test]
    fn test_sanitize_keeps_other_params() {
        let raw = format!("{}?t=99&size=large", RADAR_GIF);
        let url = sanitize_radar_url(Some(&raw), &RadarConfig::default()).unwrap();
        assert_eq!(format!("{}?size=large", RADAR_GIF), url.as_str());
    }

    #[test]
    fn test_sanitize_rejects_unknown_host() {
        let res = sanitize_radar_url(Some("https%3A%2F%2Fexample.com%2Fradar.gif"), &RadarConfig::default());
        assert_eq!(Err(RadarUrlError::HostNotAllowed), res);
        assert_eq!("host not allowed", RadarUrlError::HostNotAllowed.to_string());
    }

    #[test]
    fn test_sanitize_missing_and_invalid() {
        let config = RadarConfig::default();
        assert_eq!(Err(RadarUrlError::Missing), sanitize_radar_url(None, &config));
        assert_eq!(Err(RadarUrlError::Missing), sanitize_radar_url(Some(""), &config));
        assert_eq!(Err(RadarUrlError::Invalid), sanitize_radar_url(Some("not a url"), &config));
    }

    #[test]
    fn test_config_from_list() {
        let config = RadarConfig::new(" radar.example.com , ,sirocco.accuweather.com".split(','), 60);
        assert!(config.is_allowed("radar.example.com"));
        assert!(config.is_allowed("sirocco.accuweather.com"));
        assert!(!config.is_allowed(""));
        assert_eq!("public, max-age=60", config.cache_control());
    }

    #[test]
    fn test_display_image_src() {
        let page = r#"<html><body><div id="map"><img id="display_image" src="https://m1o.pivotalweather.com/maps/models/hrrr/2024011512/006/qpf_006h-imp.us_ma.png"></div></body></html>"#;
        assert_eq!(
            Some("https://m1o.pivotalweather.com/maps/models/hrrr/2024011512/006/qpf_006h-imp.us_ma.png".to_owned()),
            display_image_src(page).unwrap()
        );
        assert_eq!(None, display_image_src("<html><body></body></html>").unwrap());
    }

    #[tokio::test]
    async fn test_image_proxied() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/radar.png"))
            .and(query_param_is_missing("t"))
            .and(headers(
                "Accept",
                vec!["image/avif", "image/webp", "image/apng", "image/*", "*/*;q=0.8"],
            ))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Type", "image/png")
                    .set_body_bytes(vec![0x89, 0x50, 0x4e, 0x47]),
            )
            .expect(1)
            .mount(&server)
            .await;

        let service = RadarService::new(test_client(), RadarConfig::new(["127.0.0.1"], 180), "http://unused/");
        let url = sanitize_radar_url(Some(&format!("{}/radar.png?t=1", server.uri())), service.config()).unwrap();
        let image = service.image(url).await.unwrap();

        assert_eq!("image/png", image.content_type);
        assert_eq!(vec![0x89, 0x50, 0x4e, 0x47], image.body);
    }

    #[tokio::test]
    async fn test_image_upstream_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let service = RadarService::new(test_client(), RadarConfig::new(["127.0.0.1"], 180), "http://unused/");
        let url = sanitize_radar_url(Some(&format!("{}/missing.gif", server.uri())), service.config()).unwrap();
        assert!(service.image(url).await.is_err());
    }

    #[tokio::test]
    async fn test_pivotal_hrrr_qpf() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/model.php"))
            .and(query_param("m", "hrrr"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<html><body><img id="display_image" src="/maps/hrrr/qpf.png"></body></html>"#,
            ))
            .mount(&server)
            .await;

        let service = RadarService::new(
            test_client(),
            RadarConfig::default(),
            &format!("{}/model.php?m=hrrr&p=qpf_006h-imp", server.uri()),
        );
        let image = service.pivotal_hrrr_qpf().await.unwrap();
        assert_eq!(Some("/maps/hrrr/qpf.png".to_owned()), image.image_url);
    }
}
