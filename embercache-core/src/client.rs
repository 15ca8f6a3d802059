use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use reqwest::{Client, Response, StatusCode, Url};
use tracing::{debug, warn};

use crate::constants::{
    CACHE_PATH_PREFIX, DEFAULT_VALUE_TTL, HEADER_DRY_RUN, HEADER_PROMISE_TTL, HEADER_RETRY_AFTER,
    HEADER_SIZE, HEADER_SUPERHOT, HEADER_TTL,
};
use crate::error::ClientError;
use crate::rendezvous::{Node, RendezvousRouter, Xxh3Hash64};
use crate::retry::{run_with_backoff, Attempt, BackoffConfig, CancelToken};

/// A cached value plus the metadata carried on the response.
#[derive(Debug, Clone)]
pub struct Entry {
    pub value: Bytes,
    pub size: usize,
    pub remaining_ttl: Duration,
    pub superhot: bool,
}

/// Outcome of a POST (intent) request.
#[derive(Debug, Clone)]
pub enum PostOutcome {
    /// Promise granted; the caller owns the upload and must PUT.
    Accepted { promise_ttl: Duration },
    /// The key is already cached. The response carries metadata only;
    /// re-read the value with a GET.
    Exists {
        size: usize,
        remaining_ttl: Duration,
    },
    /// Another writer holds the promise; wait and retry.
    Conflict {
        promise_ttl: Duration,
        retry_after: Duration,
    },
    /// The host can never fit a value of the advertised size.
    InsufficientStorage,
}

/// Options for a POST (intent) request.
#[derive(Debug, Clone, Default)]
pub struct PostOptions {
    /// Expected value size; lets the host reject oversized uploads before
    /// any body is transferred.
    pub size: Option<u64>,
    /// Requested promise TTL; the host default applies when absent.
    pub promise_ttl: Option<Duration>,
    /// Report the admission decision without creating a promise.
    pub dry_run: bool,
}

/// HTTP client for a single cache host.
#[derive(Debug, Clone)]
pub struct HostClient {
    base_url: String,
    http: Client,
}

impl HostClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_http_client(base_url, Client::new())
    }

    pub fn with_http_client(base_url: impl Into<String>, http: Client) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { base_url, http }
    }

    pub fn for_node(node: &Node, http: Client) -> Self {
        Self::with_http_client(format!("http://{}:{}", node.id(), node.port()), http)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, key: &str) -> Result<Url, ClientError> {
        let raw = format!("{}{}{}", self.base_url, CACHE_PATH_PREFIX, key);
        Url::parse(&raw).map_err(|error| ClientError::InvalidUrl(error.to_string()))
    }

    /// Read a value. `ClientError::NotFound` covers both a plain miss and a
    /// read-after-expiry; the host does not distinguish them.
    pub async fn get(&self, key: &str) -> Result<Entry, ClientError> {
        let response = self.http.get(self.url(key)?).send().await?;

        match response.status() {
            StatusCode::OK => {
                let size = header_u64(&response, HEADER_SIZE);
                let remaining_ttl = header_millis(&response, HEADER_TTL).unwrap_or_default();
                let superhot = header_flag(&response, HEADER_SUPERHOT);
                let value = response.bytes().await?;
                Ok(Entry {
                    size: size.map(|s| s as usize).unwrap_or(value.len()),
                    remaining_ttl,
                    superhot,
                    value,
                })
            }
            StatusCode::NOT_FOUND => Err(ClientError::NotFound),
            status => Err(ClientError::UnexpectedStatus(status.as_u16())),
        }
    }

    /// Announce the intent to upload a value for `key`.
    pub async fn post(&self, key: &str, options: PostOptions) -> Result<PostOutcome, ClientError> {
        let mut request = self.http.post(self.url(key)?);
        if let Some(size) = options.size {
            request = request.header(HEADER_SIZE, size.to_string());
        }
        if let Some(promise_ttl) = options.promise_ttl {
            request = request.header(HEADER_PROMISE_TTL, promise_ttl.as_millis().to_string());
        }
        if options.dry_run {
            request = request.header(HEADER_DRY_RUN, "true");
        }

        let response = request.send().await?;
        let promise_ttl = header_millis(&response, HEADER_PROMISE_TTL).unwrap_or_default();

        match response.status() {
            StatusCode::OK => Ok(PostOutcome::Exists {
                size: header_u64(&response, HEADER_SIZE).unwrap_or_default() as usize,
                remaining_ttl: header_millis(&response, HEADER_TTL).unwrap_or_default(),
            }),
            StatusCode::ACCEPTED => Ok(PostOutcome::Accepted { promise_ttl }),
            StatusCode::CONFLICT => Ok(PostOutcome::Conflict {
                promise_ttl,
                retry_after: header_seconds(&response, HEADER_RETRY_AFTER).unwrap_or_default(),
            }),
            StatusCode::INSUFFICIENT_STORAGE => Ok(PostOutcome::InsufficientStorage),
            status => Err(ClientError::UnexpectedStatus(status.as_u16())),
        }
    }

    /// Upload a value under a previously granted promise. A `None` TTL lets
    /// the host apply its default.
    pub async fn put(
        &self,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> Result<(), ClientError> {
        let mut request = self.http.put(self.url(key)?).body(value);
        if let Some(ttl) = ttl {
            request = request.header(HEADER_TTL, ttl.as_millis().to_string());
        }

        let response = request.send().await?;
        match response.status() {
            StatusCode::OK => Ok(()),
            StatusCode::CONFLICT => Err(ClientError::NoPromise),
            StatusCode::LENGTH_REQUIRED => Err(ClientError::LengthRequired),
            StatusCode::PAYLOAD_TOO_LARGE => Err(ClientError::PayloadTooLarge),
            StatusCode::INSUFFICIENT_STORAGE => Err(ClientError::InsufficientStorage),
            StatusCode::BAD_REQUEST => Err(ClientError::BadRequest),
            status => Err(ClientError::UnexpectedStatus(status.as_u16())),
        }
    }

    /// Store a value with the full POST then PUT flow against this host.
    pub async fn set(
        &self,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> Result<(), ClientError> {
        let outcome = self
            .post(
                key,
                PostOptions {
                    size: Some(value.len() as u64),
                    ..PostOptions::default()
                },
            )
            .await?;

        match outcome {
            PostOutcome::Accepted { .. } => self.put(key, value, ttl).await,
            // Already cached; idempotent success.
            PostOutcome::Exists { .. } => Ok(()),
            PostOutcome::Conflict { retry_after, .. } => Err(ClientError::Conflict {
                retry_after: Some(retry_after),
            }),
            PostOutcome::InsufficientStorage => Err(ClientError::InsufficientStorage),
        }
    }

    /// [`HostClient::get`] with retries on transport errors. A miss is
    /// terminal.
    pub async fn get_with_retry(
        &self,
        key: &str,
        config: BackoffConfig,
        cancel: &CancelToken,
    ) -> Result<Entry, ClientError> {
        run_with_backoff(config, cancel, || async move {
            match self.get(key).await {
                Ok(entry) => Attempt::Done(entry),
                Err(ClientError::NotFound) => Attempt::Abort(ClientError::NotFound),
                Err(error) => Attempt::Retry { error, hint: None },
            }
        })
        .await
    }

    /// [`HostClient::set`] with retries on conflicts (honouring the host's
    /// Retry-After hint) and transport errors.
    pub async fn set_with_retry(
        &self,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
        config: BackoffConfig,
        cancel: &CancelToken,
    ) -> Result<(), ClientError> {
        run_with_backoff(config, cancel, || {
            let value = value.clone();
            async move {
                let outcome = match self
                    .post(
                        key,
                        PostOptions {
                            size: Some(value.len() as u64),
                            ..PostOptions::default()
                        },
                    )
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(error) => return Attempt::Retry { error, hint: None },
                };

                match outcome {
                    PostOutcome::Accepted { .. } => match self.put(key, value, ttl).await {
                        Ok(()) => Attempt::Done(()),
                        // The promise is consumed either way; retrying the
                        // POST would only hand the slot to someone else.
                        Err(error) => Attempt::Abort(error),
                    },
                    PostOutcome::Exists { .. } => Attempt::Done(()),
                    PostOutcome::Conflict { retry_after, .. } => Attempt::Retry {
                        error: ClientError::Conflict {
                            retry_after: Some(retry_after),
                        },
                        hint: Some(retry_after),
                    },
                    PostOutcome::InsufficientStorage => {
                        Attempt::Abort(ClientError::InsufficientStorage)
                    }
                }
            }
        })
        .await
    }
}

/// Source of record for cache misses. Fetching is outside the cache's scope;
/// implementations typically call a database or an upstream service.
#[async_trait]
pub trait Origin: Send + Sync {
    async fn fetch(&self, key: &str) -> Result<Bytes, ClientError>;
}

/// Tuning for the cluster client.
#[derive(Debug, Clone)]
pub struct CacheClientConfig {
    /// How many ranked hosts participate in each read and write.
    pub replication_factor: usize,
    /// Replicate read hits back to higher-ranked hosts, best effort.
    pub write_back: bool,
    pub backoff: BackoffConfig,
}

impl Default for CacheClientConfig {
    fn default() -> Self {
        Self {
            replication_factor: 2,
            write_back: true,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Cluster-aware cache client: ranks hosts per key via rendezvous hashing,
/// reads in rank order, and fans writes out to every ranked host.
///
/// Hosts stay symmetric and unaware of each other; every placement decision
/// is made here.
pub struct CacheClient {
    router: RendezvousRouter,
    http: Client,
    config: CacheClientConfig,
    cancel: CancelToken,
}

impl CacheClient {
    pub fn new(nodes: &[Node], salt: &[u8], config: CacheClientConfig) -> Self {
        Self {
            router: RendezvousRouter::new(nodes, Xxh3Hash64::with_salt(salt)),
            http: Client::new(),
            config,
            cancel: CancelToken::never(),
        }
    }

    /// Attach an ambient cancellation token; every retrying operation on
    /// this client observes it.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Swap the node set, e.g. after a topology change.
    pub fn set_nodes(&self, nodes: &[Node]) {
        self.router.set_nodes(nodes);
    }

    fn ranked_hosts(&self, key: &str) -> Vec<(Node, HostClient)> {
        self.router
            .get_nodes(key.as_bytes(), self.config.replication_factor)
            .into_iter()
            .map(|node| {
                let host = HostClient::for_node(&node, self.http.clone());
                (node, host)
            })
            .collect()
    }

    /// Read `key` from its ranked hosts in order. A hit on a lower-ranked
    /// host is optionally replicated back up the ranking.
    pub async fn get(&self, key: &str) -> Result<Entry, ClientError> {
        let hosts = self.ranked_hosts(key);
        if hosts.is_empty() {
            return Err(ClientError::NoHosts);
        }

        for (rank, (node, host)) in hosts.iter().enumerate() {
            match host.get(key).await {
                Ok(entry) => {
                    if rank > 0 && self.config.write_back {
                        self.spawn_write_back(key, &entry, &hosts[..rank]);
                    }
                    return Ok(entry);
                }
                Err(ClientError::NotFound) => continue,
                Err(error) => {
                    debug!(key, host = node.identity(), %error, "read failed, trying next host");
                    continue;
                }
            }
        }

        Err(ClientError::NotFound)
    }

    /// Store `key` on every ranked host: POST in parallel, then PUT wherever
    /// a promise was granted. Succeeds when at least one host holds the
    /// value; conflicts everywhere surface with the longest Retry-After.
    pub async fn set(
        &self,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> Result<(), ClientError> {
        let hosts = self.ranked_hosts(key);
        if hosts.is_empty() {
            return Err(ClientError::NoHosts);
        }

        let outcomes = join_all(hosts.iter().map(|(_, host)| {
            host.post(
                key,
                PostOptions {
                    size: Some(value.len() as u64),
                    ..PostOptions::default()
                },
            )
        }))
        .await;

        let mut granted: Vec<&HostClient> = Vec::new();
        let mut satisfied = 0usize;
        let mut conflict_hint: Option<Duration> = None;
        let mut last_error: Option<ClientError> = None;

        for ((node, host), outcome) in hosts.iter().zip(outcomes) {
            match outcome {
                Ok(PostOutcome::Accepted { .. }) => granted.push(host),
                // Another writer already made this host consistent.
                Ok(PostOutcome::Exists { .. }) => satisfied += 1,
                Ok(PostOutcome::Conflict { retry_after, .. }) => {
                    conflict_hint =
                        Some(conflict_hint.map_or(retry_after, |hint| hint.max(retry_after)));
                }
                Ok(PostOutcome::InsufficientStorage) => {
                    warn!(key, host = node.identity(), "host cannot fit value");
                    last_error = Some(ClientError::InsufficientStorage);
                }
                Err(error) => {
                    debug!(key, host = node.identity(), %error, "intent request failed");
                    last_error = Some(error);
                }
            }
        }

        if !granted.is_empty() {
            let uploads = join_all(
                granted
                    .iter()
                    .map(|host| host.put(key, value.clone(), ttl)),
            )
            .await;
            for upload in uploads {
                match upload {
                    Ok(()) => satisfied += 1,
                    Err(error) => last_error = Some(error),
                }
            }
        }

        if satisfied > 0 {
            return Ok(());
        }
        if let Some(retry_after) = conflict_hint {
            return Err(ClientError::Conflict {
                retry_after: Some(retry_after),
            });
        }
        Err(last_error.unwrap_or(ClientError::NoHosts))
    }

    /// [`CacheClient::get`] with retries on transport errors.
    pub async fn get_with_retry(&self, key: &str) -> Result<Entry, ClientError> {
        run_with_backoff(self.config.backoff.clone(), &self.cancel, || async move {
            match self.get(key).await {
                Ok(entry) => Attempt::Done(entry),
                Err(ClientError::NotFound) => Attempt::Abort(ClientError::NotFound),
                Err(error) => Attempt::Retry { error, hint: None },
            }
        })
        .await
    }

    /// [`CacheClient::set`] with retries on conflicts and transport errors.
    pub async fn set_with_retry(
        &self,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> Result<(), ClientError> {
        run_with_backoff(self.config.backoff.clone(), &self.cancel, || {
            let value = value.clone();
            async move {
                match self.set(key, value, ttl).await {
                    Ok(()) => Attempt::Done(()),
                    Err(ClientError::Conflict { retry_after }) => Attempt::Retry {
                        error: ClientError::Conflict { retry_after },
                        hint: retry_after,
                    },
                    Err(error @ ClientError::Transport(_)) => {
                        Attempt::Retry { error, hint: None }
                    }
                    Err(error) => Attempt::Abort(error),
                }
            }
        })
        .await
    }

    /// Read-through: serve from cache when possible, otherwise coordinate a
    /// single origin fetch through the promise protocol and fan the value
    /// out to every host that granted a promise.
    ///
    /// When every ranked host reports a conflict, some other client is
    /// already filling the key; this backs off and re-reads.
    pub async fn get_or_load(
        &self,
        key: &str,
        origin: &dyn Origin,
        ttl: Option<Duration>,
    ) -> Result<Entry, ClientError> {
        run_with_backoff(self.config.backoff.clone(), &self.cancel, || async move {
            match self.get(key).await {
                Ok(entry) => return Attempt::Done(entry),
                Err(ClientError::NotFound) => {}
                Err(error) => return Attempt::Retry { error, hint: None },
            }

            let hosts = self.ranked_hosts(key);
            if hosts.is_empty() {
                return Attempt::Abort(ClientError::NoHosts);
            }

            let outcomes = join_all(
                hosts
                    .iter()
                    .map(|(_, host)| host.post(key, PostOptions::default())),
            )
            .await;

            let mut granted: Vec<(&Node, &HostClient)> = Vec::new();
            let mut conflict_hint: Option<Duration> = None;

            for ((node, host), outcome) in hosts.iter().zip(outcomes) {
                match outcome {
                    Ok(PostOutcome::Accepted { .. }) => granted.push((node, host)),
                    Ok(PostOutcome::Exists { .. }) => {
                        // Filled between our read and the intent; re-read.
                        if let Ok(entry) = host.get(key).await {
                            return Attempt::Done(entry);
                        }
                    }
                    Ok(PostOutcome::Conflict { retry_after, .. }) => {
                        conflict_hint =
                            Some(conflict_hint.map_or(retry_after, |hint| hint.max(retry_after)));
                    }
                    Ok(PostOutcome::InsufficientStorage) => {
                        warn!(key, host = node.identity(), "host cannot fit value");
                    }
                    Err(error) => {
                        debug!(key, host = node.identity(), %error, "intent request failed");
                    }
                }
            }

            if granted.is_empty() {
                if let Some(hint) = conflict_hint {
                    // Another writer owns the key everywhere; wait for its
                    // upload and read the result.
                    return Attempt::Retry {
                        error: ClientError::Conflict {
                            retry_after: Some(hint),
                        },
                        hint: Some(hint),
                    };
                }
            }

            let value = match origin.fetch(key).await {
                Ok(value) => value,
                Err(error) => return Attempt::Abort(error),
            };

            let uploads = join_all(
                granted
                    .iter()
                    .map(|(_, host)| host.put(key, value.clone(), ttl)),
            )
            .await;
            for ((node, _), upload) in granted.iter().zip(uploads) {
                if let Err(error) = upload {
                    debug!(key, host = node.identity(), %error, "upload after origin fetch failed");
                }
            }

            Attempt::Done(Entry {
                size: value.len(),
                remaining_ttl: ttl.unwrap_or(DEFAULT_VALUE_TTL),
                superhot: false,
                value,
            })
        })
        .await
    }

    fn spawn_write_back(&self, key: &str, entry: &Entry, targets: &[(Node, HostClient)]) {
        // Replicate with the remaining TTL so copies expire with the source.
        let ttl = (!entry.remaining_ttl.is_zero()).then_some(entry.remaining_ttl);

        for (node, host) in targets {
            let host = host.clone();
            let key = key.to_string();
            let value = entry.value.clone();
            let target = node.identity().to_string();

            tokio::spawn(async move {
                if let Err(error) = host.set(&key, value, ttl).await {
                    debug!(key, host = %target, %error, "write-back replication failed");
                }
            });
        }
    }
}

fn header_str<'r>(response: &'r Response, name: &str) -> Option<&'r str> {
    response.headers().get(name)?.to_str().ok()
}

fn header_u64(response: &Response, name: &str) -> Option<u64> {
    header_str(response, name)?.parse().ok()
}

fn header_millis(response: &Response, name: &str) -> Option<Duration> {
    Some(Duration::from_millis(header_u64(response, name)?))
}

fn header_seconds(response: &Response, name: &str) -> Option<Duration> {
    Some(Duration::from_secs(header_u64(response, name)?))
}

fn header_flag(response: &Response, name: &str) -> bool {
    header_str(response, name) == Some("true")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slashes_are_trimmed() {
        let host = HostClient::new("http://cache-1:9000///");
        assert_eq!(host.base_url(), "http://cache-1:9000");
        let url = host.url("user:1").unwrap();
        assert_eq!(url.as_str(), "http://cache-1:9000/cache/user:1");
    }

    #[test]
    fn url_keeps_slashes_inside_the_key() {
        let host = HostClient::new("http://cache-1:9000");
        let url = host.url("users/42/avatar").unwrap();
        assert_eq!(url.path(), "/cache/users/42/avatar");
    }

    #[test]
    fn for_node_derives_the_address() {
        let node = Node::new("10.0.0.7", 9000);
        let host = HostClient::for_node(&node, Client::new());
        assert_eq!(host.base_url(), "http://10.0.0.7:9000");
    }
}
