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

//! Access tokens for Google Cloud REST APIs from the instance metadata server.

use crate::client::{ClientError, UpstreamClient};
use parking_lot::Mutex;
use serde::Deserialize;
use std::time::Duration;
use tokio::time::Instant;

const METADATA_FLAVOR: &str = "Metadata-Flavor";
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// OAuth access token for the default service account, refreshed shortly before expiry.
#[derive(Debug)]
pub struct MetadataTokenSource {
    client: UpstreamClient,
    url: String,
    cached: Mutex<Option<CachedToken>>,
}

impl MetadataTokenSource {
    pub fn new(client: UpstreamClient, url: &str) -> Self {
        MetadataTokenSource {
            client,
            url: url.to_owned(),
            cached: Mutex::new(None),
        }
    }

    pub async fn token(&self) -> Result<String, ClientError> {
        let cached = self.cached.lock().clone();
        if let Some(t) = cached {
            if Instant::now() < t.refresh_at {
                return Ok(t.value);
            }
        }

        let req = self.client.http().get(&self.url).header(METADATA_FLAVOR, "Google");
        let res: TokenResponse = self.client.json("gcp_metadata", req).await?;
        let lifetime = Duration::from_secs(res.expires_in).saturating_sub(REFRESH_MARGIN);

        tracing::debug!(message = "refreshed metadata access token", expires_in = res.expires_in);
        *self.cached.lock() = Some(CachedToken {
            value: res.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });

        Ok(res.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::MetadataTokenSource;
    use crate::client::tests::test_client;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_token_reused_until_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .and(header("Metadata-Flavor", "Google"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "ya29.token",
                "expires_in": 3599,
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let source = MetadataTokenSource::new(test_client(), &format!("{}/token", server.uri()));
        assert_eq!("ya29.token", source.token().await.unwrap());
        assert_eq!("ya29.token", source.token().await.unwrap());
    }

    #[tokio::test]
    async fn test_token_refreshed_when_expiring() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "short",
                "expires_in": 30
            })))
            .expect(2)
            .mount(&server)
            .await;

        let source = MetadataTokenSource::new(test_client(), &format!("{}/token", server.uri()));
        source.token().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        source.token().await.unwrap();
    }
}
