//! Fetchers built on top of a shared [`ScraperRuntime`].
//!
//! Concrete scrapers hold a runtime handle instead of owning their own cache
//! or limiter, so every scraper for the same (type, source) shares state.

use crate::api::Request;
use crate::error::{Result, ScraperError};
use crate::manager::ScraperManager;
use crate::runtime::ScraperRuntime;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::Arc;
use tracing::debug;

/// Anything that fetches through a scraper runtime
pub trait Scraper {
    fn runtime(&self) -> &Arc<ScraperRuntime>;

    fn scraper_type(&self) -> &str {
        self.runtime().scraper_type()
    }

    fn source(&self) -> &str {
        self.runtime().source()
    }
}

/// Generic JSON scraper driven by a source's endpoint table
pub struct EndpointScraper {
    runtime: Arc<ScraperRuntime>,
    /// Endpoint name -> URL template with `{name}` placeholders
    endpoints: BTreeMap<String, String>,
}

impl EndpointScraper {
    pub fn new(runtime: Arc<ScraperRuntime>, endpoints: BTreeMap<String, String>) -> Self {
        Self { runtime, endpoints }
    }

    /// Build a scraper over the manager's runtime for `scraper_type`,
    /// using the endpoint table of whichever source it resolves to.
    pub async fn from_manager(
        manager: &ScraperManager,
        scraper_type: &str,
        source: Option<&str>,
    ) -> Result<Self> {
        let runtime = manager.get(scraper_type, source).await?;
        let endpoints = manager
            .config()
            .scraper(scraper_type)
            .and_then(|type_config| type_config.sources.get(runtime.source()))
            .cloned()
            .unwrap_or_default();
        Ok(Self::new(runtime, endpoints))
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &str> {
        self.endpoints.keys().map(String::as_str)
    }

    /// Fill the endpoint's `{name}` placeholders from `path_params`
    pub fn resolve_url(&self, endpoint: &str, path_params: &[(&str, &str)]) -> Result<String> {
        let template = self
            .endpoints
            .get(endpoint)
            .ok_or_else(|| ScraperError::UnknownEndpoint {
                source_name: self.runtime.source().to_string(),
                endpoint: endpoint.to_string(),
            })?;

        let mut url = template.clone();
        for (name, value) in path_params {
            url = url.replace(&format!("{{{}}}", name), value);
        }

        if let Some(start) = url.find('{') {
            let missing = url[start + 1..].split('}').next().unwrap_or_default();
            return Err(ScraperError::InvalidRequest(format!(
                "Missing path parameter '{}' for endpoint {}",
                missing, endpoint
            )));
        }
        Ok(url)
    }

    /// GET an endpoint as JSON through the runtime's cache.
    ///
    /// `ttl_kind` picks a TTL from the `[cache.ttl]` table; `None` uses the
    /// default TTL.
    pub async fn fetch_json<T>(
        &self,
        endpoint: &str,
        path_params: &[(&str, &str)],
        query: &[(&str, &str)],
        ttl_kind: Option<&str>,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        let url = self.resolve_url(endpoint, path_params)?;

        let named: Vec<(&str, &dyn Display)> = path_params
            .iter()
            .chain(query.iter())
            .map(|(name, value)| (*name, value as &dyn Display))
            .collect();
        let key = ScraperRuntime::build_cache_key(endpoint, &[], &named);
        let ttl = ttl_kind.map(|kind| self.runtime.ttl_for(kind));

        let request = query
            .iter()
            .fold(Request::get(url), |request, (name, value)| request.query(*name, value));

        debug!(instance = %self.runtime.name(), endpoint = endpoint, key = %key, "Fetching endpoint");

        let runtime = self.runtime.as_ref();
        runtime
            .fetch_with_cache(&key, ttl, move || async move {
                runtime.execute(&request).await?.json()
            })
            .await
    }
}

impl Scraper for EndpointScraper {
    fn runtime(&self) -> &Arc<ScraperRuntime> {
        &self.runtime
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::Value;
    use shared::{Config, ScraperTypeConfig};

    async fn scraper_for(base_url: &str) -> EndpointScraper {
        let mut config = Config::default();
        config.request.max_retries = 0;

        let mut endpoints = BTreeMap::new();
        endpoints.insert("teams".to_string(), format!("{}/teams", base_url));
        endpoints.insert("player".to_string(), format!("{}/athletes/{{player_id}}", base_url));
        let mut sources = BTreeMap::new();
        sources.insert("mock".to_string(), endpoints);

        config.scrapers.insert(
            "test".to_string(),
            ScraperTypeConfig {
                default_source: "mock".to_string(),
                adaptive: false,
                max_calls: Some(100),
                period_secs: Some(1),
                headers: BTreeMap::new(),
                sources,
            },
        );

        let manager = ScraperManager::new(config);
        EndpointScraper::from_manager(&manager, "test", None).await.unwrap()
    }

    #[tokio::test]
    async fn test_resolve_url() {
        let scraper = scraper_for("http://localhost").await;

        assert_eq!(
            scraper.resolve_url("player", &[("player_id", "3139477")]).unwrap(),
            "http://localhost/athletes/3139477"
        );
        assert!(matches!(
            scraper.resolve_url("player", &[]),
            Err(ScraperError::InvalidRequest(msg)) if msg.contains("player_id")
        ));
        assert!(matches!(
            scraper.resolve_url("schedule", &[]),
            Err(ScraperError::UnknownEndpoint { endpoint, .. }) if endpoint == "schedule"
        ));
        assert_eq!(scraper.endpoints().collect::<Vec<_>>(), vec!["player", "teams"]);
        assert_eq!(scraper.source(), "mock");
        assert_eq!(scraper.scraper_type(), "test");
    }

    #[tokio::test]
    async fn test_fetch_json_is_cached_per_parameters() {
        let mut server = mockito::Server::new_async().await;
        let week_one = server
            .mock("GET", "/teams")
            .match_query(Matcher::UrlEncoded("week".into(), "1".into()))
            .with_status(200)
            .with_body(r#"{"week": 1}"#)
            .expect(1)
            .create_async()
            .await;
        let week_two = server
            .mock("GET", "/teams")
            .match_query(Matcher::UrlEncoded("week".into(), "2".into()))
            .with_status(200)
            .with_body(r#"{"week": 2}"#)
            .expect(1)
            .create_async()
            .await;

        let scraper = scraper_for(&server.url()).await;

        for _ in 0..2 {
            let one: Value = scraper
                .fetch_json("teams", &[], &[("week", "1")], Some("team_data"))
                .await
                .unwrap();
            assert_eq!(one["week"], 1);
        }
        let two: Value = scraper
            .fetch_json("teams", &[], &[("week", "2")], None)
            .await
            .unwrap();
        assert_eq!(two["week"], 2);

        week_one.assert_async().await;
        week_two.assert_async().await;
        assert_eq!(scraper.runtime().stats().await.cache.unwrap().entries, 2);
    }

    #[tokio::test]
    async fn test_fetch_json_with_path_params() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/athletes/42")
            .with_status(200)
            .with_body(r#"{"id": 42, "name": "Walter Payton"}"#)
            .create_async()
            .await;

        let scraper = scraper_for(&server.url()).await;
        let player: Value = scraper
            .fetch_json("player", &[("player_id", "42")], &[], Some("player_data"))
            .await
            .unwrap();

        assert_eq!(player["name"], "Walter Payton");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_json_decode_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/teams")
            .with_status(200)
            .with_body("<html>maintenance</html>")
            .create_async()
            .await;

        let scraper = scraper_for(&server.url()).await;
        let result: Result<Value> = scraper.fetch_json("teams", &[], &[], None).await;
        assert!(matches!(result, Err(ScraperError::Decode(_))));
    }

    #[tokio::test]
    async fn test_scrapers_share_runtime_state() {
        let manager = ScraperManager::new(Config::default());
        let a = EndpointScraper::from_manager(&manager, "foolsball", None).await.unwrap();
        let b = EndpointScraper::from_manager(&manager, "foolsball", Some("espn")).await.unwrap();

        assert!(Arc::ptr_eq(a.runtime(), b.runtime()));
        assert!(a.endpoints().any(|endpoint| endpoint == "teams"));
    }
}
