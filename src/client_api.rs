// =============================================================================
// Client API — hashing-ignored-field-lists registry with coalesced caching
// =============================================================================
//
// The registry is fetched over a single REST call and cached in memory for
// one hour. Concurrent callers with no cached value share one in-flight
// fetch; every awaiter observes the same result or the same failure. A
// failed fetch never populates the cache.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Result, SdkError};

/// How long a fetched field-list set stays fresh.
const CACHE_TTL: Duration = Duration::from_secs(3600);

/// Host prefix resolved against the caller's region.
const CLIENT_API_HOST: &str = "https://trade-client-api-v1";

/// Fields excluded from content hashing for one object kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IgnoredFieldLists {
    #[serde(default)]
    pub specification: Vec<String>,
    #[serde(default)]
    pub position: Vec<String>,
    #[serde(default)]
    pub order: Vec<String>,
}

/// Ignored-field lists per account generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HashingIgnoredFieldLists {
    #[serde(default)]
    pub g1: IgnoredFieldLists,
    #[serde(default)]
    pub g2: IgnoredFieldLists,
}

impl HashingIgnoredFieldLists {
    /// Lists for an account type tag (`cloud-g1` selects g1, everything
    /// else g2).
    pub fn for_account_type(&self, account_type: &str) -> &IgnoredFieldLists {
        if account_type == "cloud-g1" {
            &self.g1
        } else {
            &self.g2
        }
    }
}

/// Maps a service host prefix and region tag to a concrete base URL.
#[async_trait]
pub trait UrlResolver: Send + Sync {
    async fn get_url(&self, host: &str, region: &str) -> Result<String>;
}

/// Standard resolver: `{host}.{region}.{domain}`.
pub struct RegionUrlResolver {
    pub domain: String,
}

#[async_trait]
impl UrlResolver for RegionUrlResolver {
    async fn get_url(&self, host: &str, region: &str) -> Result<String> {
        Ok(format!("{host}.{region}.{}", self.domain))
    }
}

/// Transport behind the registry fetch, pluggable so the caching layer can
/// be exercised without a network.
#[async_trait]
pub trait HashingFieldsApi: Send + Sync {
    async fn fetch_ignored_field_lists(&self, region: &str) -> Result<HashingIgnoredFieldLists>;
}

/// REST implementation of the registry fetch.
pub struct RestHashingFieldsApi {
    http: reqwest::Client,
    token: String,
    url_resolver: Arc<dyn UrlResolver>,
}

impl RestHashingFieldsApi {
    pub fn new(token: impl Into<String>, url_resolver: Arc<dyn UrlResolver>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");
        Self {
            http,
            token: token.into(),
            url_resolver,
        }
    }
}

#[async_trait]
impl HashingFieldsApi for RestHashingFieldsApi {
    async fn fetch_ignored_field_lists(&self, region: &str) -> Result<HashingIgnoredFieldLists> {
        let base = self.url_resolver.get_url(CLIENT_API_HOST, region).await?;
        let url = format!("{base}/hashing-ignored-field-lists");
        debug!(url = %url, "fetching hashing-ignored field lists");

        let resp = self
            .http
            .get(&url)
            .header("auth-token", &self.token)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SdkError::Transport(format!(
                "GET {url} returned {status}: {body}"
            )));
        }
        Ok(resp.json().await?)
    }
}

type FetchFuture = Shared<BoxFuture<'static, Result<HashingIgnoredFieldLists>>>;

#[derive(Default)]
struct Cache {
    value: Option<(tokio::time::Instant, HashingIgnoredFieldLists)>,
    inflight: Option<FetchFuture>,
}

/// Caching front of the hashing-ignored-field-lists registry.
pub struct ClientApiClient {
    api: Arc<dyn HashingFieldsApi>,
    cache: Arc<Mutex<Cache>>,
}

impl ClientApiClient {
    pub fn new(api: Arc<dyn HashingFieldsApi>) -> Self {
        Self {
            api,
            cache: Arc::new(Mutex::new(Cache::default())),
        }
    }

    /// Convenience constructor wiring the REST transport.
    pub fn with_rest(token: impl Into<String>, url_resolver: Arc<dyn UrlResolver>) -> Self {
        Self::new(Arc::new(RestHashingFieldsApi::new(token, url_resolver)))
    }

    /// Ignored-field lists for `region`, from cache when fresh.
    pub async fn get_hashing_ignored_field_lists(
        &self,
        region: &str,
    ) -> Result<HashingIgnoredFieldLists> {
        let fetch = {
            let mut cache = self.cache.lock().await;
            if let Some((at, lists)) = &cache.value {
                if at.elapsed() < CACHE_TTL {
                    return Ok(lists.clone());
                }
            }
            match &cache.inflight {
                Some(inflight) => inflight.clone(),
                None => {
                    let api = Arc::clone(&self.api);
                    let cache_slot = Arc::clone(&self.cache);
                    let region = region.to_string();
                    let fetch: FetchFuture = async move {
                        let result = api.fetch_ignored_field_lists(&region).await;
                        let mut cache = cache_slot.lock().await;
                        cache.inflight = None;
                        if let Ok(lists) = &result {
                            cache.value =
                                Some((tokio::time::Instant::now(), lists.clone()));
                        }
                        result
                    }
                    .boxed()
                    .shared();
                    cache.inflight = Some(fetch.clone());
                    fetch
                }
            }
        };
        fetch.await
    }
}
