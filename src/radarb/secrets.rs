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

//! Resolution of API keys and other credentials.
//!
//! Every secret used by the proxy is named by a [`Secret`] variant and resolved to a
//! Secret Manager resource path. Values are assumed to be immutable for the life of the
//! process: [`SecretCache`] looks each one up at most once and keeps it forever.

use crate::client::{join_url, ClientError, UpstreamClient};
use crate::gcp::MetadataTokenSource;
use async_trait::async_trait;
use base64::Engine;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OnceCell;

/// Project number that owns the Secret Manager secrets.
pub const DEFAULT_PROJECT: &str = "358874041676";

const ENV_PREFIX: &str = "RADARB_SECRET_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Secret {
    OhgoApi,
    AeroApi,
    GoogleMaps,
    OpenWeatherMap,
    AmbientApplicationKey,
    AmbientApiKey,
    Vertex,
}

impl Secret {
    pub const ALL: [Secret; 7] = [
        Secret::OhgoApi,
        Secret::AeroApi,
        Secret::GoogleMaps,
        Secret::OpenWeatherMap,
        Secret::AmbientApplicationKey,
        Secret::AmbientApiKey,
        Secret::Vertex,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Secret::OhgoApi => "ohgo-api",
            Secret::AeroApi => "aeroapi",
            Secret::GoogleMaps => "google-maps-api",
            Secret::OpenWeatherMap => "openweathermap",
            Secret::AmbientApplicationKey => "ambient-weather-application-key",
            Secret::AmbientApiKey => "ambient-weather-api-key",
            Secret::Vertex => "vertex",
        }
    }

    fn version(&self) -> &'static str {
        match self {
            // Pinned, the key was rotated without retiring version 1
            Secret::Vertex => "1",
            _ => "latest",
        }
    }

    pub fn resource_path(&self, project: &str) -> String {
        format!("projects/{}/secrets/{}/versions/{}", project, self.name(), self.version())
    }

    /// Environment variable holding this secret, e.g. `RADARB_SECRET_OHGO_API`.
    pub fn env_var(&self) -> String {
        format!("{}{}", ENV_PREFIX, self.name().replace('-', "_").to_uppercase())
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret {0} is not configured")]
    Missing(String),
    #[error("unable to access secret {0}: {1}")]
    Access(String, String),
    #[error("secret {0} is not valid UTF-8")]
    Encoding(String),
}

/// Backend that can look up the value of a secret by its resource path.
#[async_trait]
pub trait SecretSource: Send + Sync + fmt::Debug {
    async fn access(&self, resource: &str) -> Result<String, SecretError>;
}

/// Secrets known up front, keyed by resource path.
#[derive(Debug, Default, Clone)]
pub struct StaticSecrets {
    values: HashMap<String, String>,
}

impl StaticSecrets {
    pub fn new(values: HashMap<String, String>) -> Self {
        StaticSecrets { values }
    }

    /// Read each known secret from its `RADARB_SECRET_*` environment variable.
    pub fn from_env(project: &str) -> Self {
        let values = Secret::ALL
            .iter()
            .filter_map(|s| env::var(s.env_var()).ok().map(|v| (s.resource_path(project), v)))
            .collect();

        StaticSecrets { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[async_trait]
impl SecretSource for StaticSecrets {
    async fn access(&self, resource: &str) -> Result<String, SecretError> {
        self.values
            .get(resource)
            .cloned()
            .ok_or_else(|| SecretError::Missing(resource.to_owned()))
    }
}

#[derive(Debug, Deserialize)]
struct AccessResponse {
    payload: Payload,
}

#[derive(Debug, Deserialize)]
struct Payload {
    data: String,
}

/// Google Cloud Secret Manager, authorized with the instance service account.
#[derive(Debug)]
pub struct SecretManagerSource {
    client: UpstreamClient,
    base_url: String,
    tokens: Arc<MetadataTokenSource>,
}

impl SecretManagerSource {
    pub fn new(client: UpstreamClient, base_url: &str, tokens: Arc<MetadataTokenSource>) -> Self {
        SecretManagerSource {
            client,
            base_url: base_url.to_owned(),
            tokens,
        }
    }

    async fn fetch(&self, resource: &str) -> Result<String, ClientError> {
        let token = self.tokens.token().await?;
        let url = join_url(&self.base_url, &format!("{}:access", resource))?;
        let req = self.client.http().get(url).bearer_auth(token);
        let res: AccessResponse = self.client.json("secret_manager", req).await?;
        Ok(res.payload.data)
    }
}

#[async_trait]
impl SecretSource for SecretManagerSource {
    async fn access(&self, resource: &str) -> Result<String, SecretError> {
        let data = self
            .fetch(resource)
            .await
            .map_err(|e| SecretError::Access(resource.to_owned(), e.to_string()))?;

        let bytes = base64::engine::general_purpose::STANDARD
            .decode(data.as_bytes())
            .map_err(|e| SecretError::Access(resource.to_owned(), e.to_string()))?;

        String::from_utf8(bytes).map_err(|_| SecretError::Encoding(resource.to_owned()))
    }
}

/// Memoizes secret lookups per resource path for the lifetime of the process.
///
/// Concurrent requests for the same secret share a single lookup. Failed lookups are
/// not remembered and will be retried by the next caller.
#[derive(Debug)]
pub struct SecretCache {
    source: Arc<dyn SecretSource>,
    project: String,
    cells: Mutex<HashMap<String, Arc<OnceCell<String>>>>,
}

impl SecretCache {
    pub fn new(source: Arc<dyn SecretSource>, project: &str) -> Self {
        SecretCache {
            source,
            project: project.to_owned(),
            cells: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, secret: Secret) -> Result<String, SecretError> {
        self.resolve(&secret.resource_path(&self.project)).await
    }

    pub async fn resolve(&self, resource: &str) -> Result<String, SecretError> {
        let cell = {
            let mut cells = self.cells.lock();
            cells.entry(resource.to_owned()).or_default().clone()
        };

        let value = cell.get_or_try_init(|| self.source.access(resource)).await?;
        Ok(value.clone())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::{Secret, SecretCache, SecretError, SecretManagerSource, SecretSource, StaticSecrets};
    use crate::client::tests::test_client;
    use crate::gcp::MetadataTokenSource;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Debug, Default)]
    struct CountingSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SecretSource for CountingSource {
        async fn access(&self, resource: &str) -> Result<String, SecretError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("value-for-{}", resource))
        }
    }

    /// Secret cache where every secret has the value `value-for-<name>`.
    pub(crate) fn test_secrets() -> Arc<SecretCache> {
        let values = Secret::ALL
            .iter()
            .map(|s| (s.resource_path("demo"), format!("value-for-{}", s.name())))
            .collect::<HashMap<_, _>>();
        Arc::new(SecretCache::new(Arc::new(StaticSecrets::new(values)), "demo"))
    }

    #[test]
    fn test_resource_path() {
        assert_eq!(
            "projects/358874041676/secrets/ohgo-api/versions/latest",
            Secret::OhgoApi.resource_path("358874041676")
        );
        assert_eq!(
            "projects/358874041676/secrets/vertex/versions/1",
            Secret::Vertex.resource_path("358874041676")
        );
    }

    #[test]
    fn test_env_var() {
        assert_eq!(
            "RADARB_SECRET_AMBIENT_WEATHER_API_KEY",
            Secret::AmbientApiKey.env_var()
        );
    }

    #[tokio::test]
    async fn test_memoizes_secrets_by_name() {
        let source = Arc::new(CountingSource::default());
        let cache = SecretCache::new(source.clone(), "demo");

        let first = cache.resolve("projects/demo/secrets/alpha/versions/latest").await.unwrap();
        let second = cache.resolve("projects/demo/secrets/alpha/versions/latest").await.unwrap();

        assert_eq!("value-for-projects/demo/secrets/alpha/versions/latest", first);
        assert_eq!(first, second);
        assert_eq!(1, source.calls.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_caches_each_secret_independently() {
        let source = Arc::new(CountingSource::default());
        let cache = SecretCache::new(source.clone(), "demo");

        let first = cache.resolve("projects/demo/secrets/alpha/versions/latest").await.unwrap();
        let second = cache.resolve("projects/demo/secrets/beta/versions/latest").await.unwrap();

        assert_eq!("value-for-projects/demo/secrets/alpha/versions/latest", first);
        assert_eq!("value-for-projects/demo/secrets/beta/versions/latest", second);
        assert_eq!(2, source.calls.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_concurrent_lookups_share_one_call() {
        let source = Arc::new(CountingSource::default());
        let cache = Arc::new(SecretCache::new(source.clone(), "demo"));

        let (a, b) = tokio::join!(cache.get(Secret::OhgoApi), cache.get(Secret::OhgoApi));

        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(1, source.calls.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_missing_secret_not_memoized() {
        let cache = SecretCache::new(Arc::new(StaticSecrets::default()), "demo");

        let res = cache.get(Secret::AeroApi).await;
        assert!(matches!(res, Err(SecretError::Missing(_))));
        let res = cache.get(Secret::AeroApi).await;
        assert!(matches!(res, Err(SecretError::Missing(_))));
    }

    #[tokio::test]
    async fn test_secret_manager_decodes_payload() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "ya29.token",
                "expires_in": 3599
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/secretmanager/projects/demo/secrets/ohgo-api/versions/latest:access"))
            .and(header("Authorization", "Bearer ya29.token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "projects/demo/secrets/ohgo-api/versions/3",
                // base64 of "ohgo-key"
                "payload": {"data": "b2hnby1rZXk="}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let tokens = Arc::new(MetadataTokenSource::new(test_client(), &format!("{}/token", server.uri())));
        let source = SecretManagerSource::new(test_client(), &format!("{}/secretmanager/", server.uri()), tokens);
        let cache = SecretCache::new(Arc::new(source), "demo");

        assert_eq!("ohgo-key", cache.get(Secret::OhgoApi).await.unwrap());
        assert_eq!("ohgo-key", cache.get(Secret::OhgoApi).await.unwrap());
    }
}
