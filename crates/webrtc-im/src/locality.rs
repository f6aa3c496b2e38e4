//! Locality classification
//!
//! Finds this endpoint's externally visible address by asking a chain of
//! public resolvers, caches it, and compares it with a peer's advertised
//! identity. Equal addresses mean both endpoints sit behind the same NAT,
//! which is treated as "near". Anything unproven is "far".

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::LocalityConfig;
use crate::types::{Locality, NetworkIdentity};

/// Per-resolver timeout
pub const RESOLVE_TIMEOUT: Duration = Duration::from_millis(1500);

/// How long a resolved identity stays valid
pub const IDENTITY_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("No address in response")]
    NoAddress,
}

/// One external source of "what is my address"
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    fn name(&self) -> &str;

    async fn resolve(&self) -> Result<String, ResolveError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    /// `{"ip": "..."}`
    JsonIp,
    /// Bare address, possibly with trailing newline
    PlainText,
    /// `key=value` lines with an `ip=` entry
    CloudflareTrace,
}

pub fn parse_response(format: ResponseFormat, body: &str) -> Option<String> {
    let ip = match format {
        ResponseFormat::JsonIp => serde_json::from_str::<serde_json::Value>(body)
            .ok()?
            .get("ip")?
            .as_str()?
            .trim()
            .to_string(),
        ResponseFormat::PlainText => body.trim().to_string(),
        ResponseFormat::CloudflareTrace => body
            .lines()
            .find_map(|line| line.strip_prefix("ip="))?
            .trim()
            .to_string(),
    };
    (!ip.is_empty()).then_some(ip)
}

/// Resolver backed by an HTTP endpoint
pub struct HttpIdentityResolver {
    url: String,
    format: ResponseFormat,
    http: reqwest::Client,
}

impl HttpIdentityResolver {
    pub fn new(url: impl Into<String>, format: ResponseFormat, http: reqwest::Client) -> Self {
        Self {
            url: url.into(),
            format,
            http,
        }
    }
}

#[async_trait]
impl IdentityResolver for HttpIdentityResolver {
    fn name(&self) -> &str {
        &self.url
    }

    async fn resolve(&self) -> Result<String, ResolveError> {
        let body = self
            .http
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        parse_response(self.format, &body).ok_or(ResolveError::NoAddress)
    }
}

/// Resolver that always answers with a fixed address
pub struct StaticIdentityResolver {
    address: String,
}

impl StaticIdentityResolver {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl IdentityResolver for StaticIdentityResolver {
    fn name(&self) -> &str {
        "static"
    }

    async fn resolve(&self) -> Result<String, ResolveError> {
        if self.address.is_empty() {
            return Err(ResolveError::NoAddress);
        }
        Ok(self.address.clone())
    }
}

fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

/// The public resolver chain with the default per-request timeout
pub fn default_resolvers() -> Vec<Arc<dyn IdentityResolver>> {
    http_resolvers(RESOLVE_TIMEOUT)
}

/// The public resolver chain, in the order it is tried
pub fn http_resolvers(timeout: Duration) -> Vec<Arc<dyn IdentityResolver>> {
    let http = http_client(timeout);
    let chain = [
        ("https://api.ipify.org?format=json", ResponseFormat::JsonIp),
        ("https://ipinfo.io/json", ResponseFormat::JsonIp),
        ("https://ipv4.icanhazip.com", ResponseFormat::PlainText),
        ("https://ifconfig.me/ip", ResponseFormat::PlainText),
        (
            "https://www.cloudflare.com/cdn-cgi/trace",
            ResponseFormat::CloudflareTrace,
        ),
    ];
    chain
        .into_iter()
        .map(|(url, format)| {
            Arc::new(HttpIdentityResolver::new(url, format, http.clone())) as Arc<dyn IdentityResolver>
        })
        .collect()
}

/// NEAR only when both identities are known and equal
pub fn classify(self_identity: &NetworkIdentity, peer_identity: &NetworkIdentity) -> Locality {
    match (self_identity, peer_identity) {
        (NetworkIdentity::Known(a), NetworkIdentity::Known(b)) if a == b => Locality::Near,
        _ => Locality::Far,
    }
}

#[derive(Debug, Clone)]
struct CachedIdentity {
    address: String,
    resolved_at: SystemTime,
}

impl CachedIdentity {
    fn is_fresh(&self, ttl: Duration) -> bool {
        SystemTime::now()
            .duration_since(self.resolved_at)
            .map(|age| age < ttl)
            .unwrap_or(false)
    }
}

/// On-disk form of the cache
#[derive(Debug, Serialize, Deserialize)]
struct CacheRecord {
    ip: String,
    /// Unix millis
    ts: u64,
}

fn unix_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

async fn read_cache_file(path: &Path) -> Option<CachedIdentity> {
    let content = tokio::fs::read_to_string(path).await.ok()?;
    let record: CacheRecord = serde_json::from_str(&content).ok()?;
    if record.ip.is_empty() || NetworkIdentity::from_wire(&record.ip).is_unknown() {
        return None;
    }
    Some(CachedIdentity {
        address: record.ip,
        resolved_at: UNIX_EPOCH + Duration::from_millis(record.ts),
    })
}

async fn write_cache_file(path: &Path, cached: &CachedIdentity) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let record = CacheRecord {
        ip: cached.address.clone(),
        ts: unix_millis(cached.resolved_at),
    };
    tokio::fs::write(path, serde_json::to_string(&record)?).await
}

/// Resolves and caches the local network identity
///
/// The cache belongs to this instance; share it by sharing the classifier.
pub struct LocalityClassifier {
    resolvers: Vec<Arc<dyn IdentityResolver>>,
    timeout: Duration,
    ttl: Duration,
    cache_file: Option<PathBuf>,
    cache: RwLock<Option<CachedIdentity>>,
}

impl LocalityClassifier {
    pub fn new(resolvers: Vec<Arc<dyn IdentityResolver>>) -> Self {
        Self {
            resolvers,
            timeout: RESOLVE_TIMEOUT,
            ttl: IDENTITY_TTL,
            cache_file: None,
            cache: RwLock::new(None),
        }
    }

    pub fn with_default_resolvers() -> Self {
        Self::new(default_resolvers())
    }

    pub fn from_config(config: &LocalityConfig, resolvers: Vec<Arc<dyn IdentityResolver>>) -> Self {
        let mut classifier = Self::new(resolvers)
            .with_timeout(config.resolve_timeout())
            .with_ttl(Duration::from_secs(config.cache_ttl_secs));
        classifier.cache_file = config.cache_file.clone();
        classifier
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Persist the cache across restarts
    pub fn with_cache_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_file = Some(path.into());
        self
    }

    /// First successful resolver wins; never fails
    pub async fn resolve_self_identity(&self) -> NetworkIdentity {
        if let Some(identity) = self.cached_identity().await {
            return identity;
        }

        let persisted = match self.cache_file.as_deref() {
            Some(path) => read_cache_file(path).await,
            None => None,
        };
        if let Some(cached) = persisted {
            if cached.is_fresh(self.ttl) {
                debug!("Using persisted identity {}", cached.address);
                let identity = NetworkIdentity::Known(cached.address.clone());
                *self.cache.write().await = Some(cached);
                return identity;
            }
        }

        for resolver in &self.resolvers {
            match tokio::time::timeout(self.timeout, resolver.resolve()).await {
                Ok(Ok(address)) => {
                    let identity = NetworkIdentity::from_wire(&address);
                    if let NetworkIdentity::Known(address) = &identity {
                        info!("Resolved network identity {} via {}", address, resolver.name());
                        self.store(address.clone()).await;
                        return identity;
                    }
                    debug!("Resolver {} returned no usable address", resolver.name());
                }
                Ok(Err(e)) => debug!("Resolver {} failed: {}", resolver.name(), e),
                Err(_) => debug!("Resolver {} timed out", resolver.name()),
            }
        }

        warn!("All identity resolvers failed, treating identity as unknown");
        NetworkIdentity::Unknown
    }

    /// Cached identity if still within its TTL
    pub async fn cached_identity(&self) -> Option<NetworkIdentity> {
        self.cache
            .read()
            .await
            .as_ref()
            .filter(|c| c.is_fresh(self.ttl))
            .map(|c| NetworkIdentity::Known(c.address.clone()))
    }

    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
    }

    /// Classify a peer against our own (possibly freshly resolved) identity
    pub async fn classify_peer(&self, peer_identity: &NetworkIdentity) -> Locality {
        let own = self.resolve_self_identity().await;
        classify(&own, peer_identity)
    }

    async fn store(&self, address: String) {
        let cached = CachedIdentity {
            address,
            resolved_at: SystemTime::now(),
        };
        if let Some(path) = &self.cache_file {
            if let Err(e) = write_cache_file(path, &cached).await {
                warn!("Failed to persist identity cache {}: {}", path.display(), e);
            }
        }
        *self.cache.write().await = Some(cached);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingResolver {
        answer: Option<String>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl CountingResolver {
        fn new(answer: Option<&str>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                answer: answer.map(str::to_string),
                delay,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl IdentityResolver for CountingResolver {
        fn name(&self) -> &str {
            "counting"
        }

        async fn resolve(&self) -> Result<String, ResolveError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.answer.clone().ok_or(ResolveError::NoAddress)
        }
    }

    fn known(s: &str) -> NetworkIdentity {
        NetworkIdentity::Known(s.to_string())
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(&known("1.2.3.4"), &known("1.2.3.4")), Locality::Near);
        assert_eq!(classify(&known("1.2.3.4"), &known("5.6.7.8")), Locality::Far);
        assert_eq!(classify(&NetworkIdentity::Unknown, &known("5.6.7.8")), Locality::Far);
        assert_eq!(classify(&known("5.6.7.8"), &NetworkIdentity::Unknown), Locality::Far);
        assert_eq!(
            classify(&NetworkIdentity::Unknown, &NetworkIdentity::Unknown),
            Locality::Far
        );
    }

    #[test]
    fn test_parse_response_formats() {
        assert_eq!(
            parse_response(ResponseFormat::JsonIp, r#"{"ip":"1.2.3.4"}"#),
            Some("1.2.3.4".to_string())
        );
        assert_eq!(parse_response(ResponseFormat::JsonIp, r#"{"ip":""}"#), None);
        assert_eq!(parse_response(ResponseFormat::JsonIp, "not json"), None);
        assert_eq!(
            parse_response(ResponseFormat::PlainText, "1.2.3.4\n"),
            Some("1.2.3.4".to_string())
        );
        assert_eq!(
            parse_response(
                ResponseFormat::CloudflareTrace,
                "fl=1\nh=www.cloudflare.com\nip=9.8.7.6\nts=1\n"
            ),
            Some("9.8.7.6".to_string())
        );
        assert_eq!(parse_response(ResponseFormat::CloudflareTrace, "fl=1\n"), None);
    }

    #[tokio::test]
    async fn test_first_success_wins_and_is_cached() {
        let failing = CountingResolver::new(None, Duration::ZERO);
        let good = CountingResolver::new(Some("1.2.3.4"), Duration::ZERO);
        let never = CountingResolver::new(Some("9.9.9.9"), Duration::ZERO);
        let classifier =
            LocalityClassifier::new(vec![failing.clone(), good.clone(), never.clone()]);

        assert_eq!(classifier.resolve_self_identity().await, known("1.2.3.4"));
        assert_eq!(classifier.resolve_self_identity().await, known("1.2.3.4"));
        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
        assert_eq!(good.calls.load(Ordering::SeqCst), 1);
        assert_eq!(never.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_slow_resolver_times_out() {
        let slow = CountingResolver::new(Some("1.1.1.1"), Duration::from_secs(5));
        let good = CountingResolver::new(Some("2.2.2.2"), Duration::ZERO);
        let classifier = LocalityClassifier::new(vec![slow, good])
            .with_timeout(Duration::from_millis(20));

        assert_eq!(classifier.resolve_self_identity().await, known("2.2.2.2"));
    }

    #[tokio::test]
    async fn test_all_failing_is_unknown_and_not_cached() {
        let failing = CountingResolver::new(None, Duration::ZERO);
        let sentinel = CountingResolver::new(Some("WAN"), Duration::ZERO);
        let classifier = LocalityClassifier::new(vec![failing.clone(), sentinel]);

        assert!(classifier.resolve_self_identity().await.is_unknown());
        assert!(classifier.cached_identity().await.is_none());
        classifier.resolve_self_identity().await;
        assert_eq!(failing.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_expired_cache_resolves_again() {
        let good = CountingResolver::new(Some("1.2.3.4"), Duration::ZERO);
        let classifier = LocalityClassifier::new(vec![good.clone()]).with_ttl(Duration::ZERO);

        classifier.resolve_self_identity().await;
        classifier.resolve_self_identity().await;
        assert_eq!(good.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cache_file_survives_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");

        let first = LocalityClassifier::new(vec![Arc::new(StaticIdentityResolver::new("1.2.3.4"))])
            .with_cache_file(&path);
        assert_eq!(first.resolve_self_identity().await, known("1.2.3.4"));
        assert!(path.exists());

        let unused = CountingResolver::new(Some("5.5.5.5"), Duration::ZERO);
        let second = LocalityClassifier::new(vec![unused.clone()]).with_cache_file(&path);
        assert_eq!(second.resolve_self_identity().await, known("1.2.3.4"));
        assert_eq!(unused.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stale_cache_file_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");
        std::fs::write(&path, r#"{"ip":"1.2.3.4","ts":0}"#).unwrap();

        let classifier =
            LocalityClassifier::new(vec![Arc::new(StaticIdentityResolver::new("5.6.7.8"))])
                .with_cache_file(&path);
        assert_eq!(classifier.resolve_self_identity().await, known("5.6.7.8"));
    }

    #[tokio::test]
    async fn test_http_resolver_uses_client_timeout() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept and never answer
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let resolver = HttpIdentityResolver::new(
            format!("http://{}/", addr),
            ResponseFormat::PlainText,
            http_client(Duration::from_millis(100)),
        );
        let result = tokio::time::timeout(Duration::from_secs(2), resolver.resolve())
            .await
            .expect("client timeout was not applied");
        assert!(matches!(result, Err(ResolveError::Http(_))));
        assert_eq!(http_resolvers(Duration::from_millis(100)).len(), 5);
        server.abort();
    }

    #[tokio::test]
    async fn test_classify_peer() {
        let classifier =
            LocalityClassifier::new(vec![Arc::new(StaticIdentityResolver::new("1.2.3.4"))]);
        assert_eq!(classifier.classify_peer(&known("1.2.3.4")).await, Locality::Near);
        assert_eq!(classifier.classify_peer(&known("4.3.2.1")).await, Locality::Far);
    }
}
