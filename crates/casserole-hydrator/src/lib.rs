//! Origin client: the only component in casserole that is allowed to talk
//! to the upstream mirror. Everything downstream (disk store, distributed
//! cache, orchestrator) is a decorator over the decisions made here.

mod config;

use std::{collections::HashMap, time::SystemTime};

use bytes::Bytes;
use casserole_types::{CacheDecision, CacheOutcome, CasseroleError, Hydrator, OriginResponse, Result};
use futures::StreamExt;
use http::{request, response, HeaderValue, Method, StatusCode};
use http_cache_semantics::CachePolicy;
use url::Url;

pub use config::HydratorConfig;

/// Response headers worth remembering verbatim once an object is cached;
/// everything else is re-derived from the origin on every hydration.
const IDENTITY_HEADERS: &[&str] = &[
    "accept-ranges",
    "content-encoding",
    "content-length",
    "content-md5",
    "content-type",
    "etag",
    "last-modified",
];

/// `reqwest`-backed [`Hydrator`]. Builds one pooled client per origin and
/// reuses it for metadata probes, ranged block fetches, and passthrough
/// streaming.
pub struct ReqwestHydrator {
    config: HydratorConfig,
    client: reqwest::Client,
}

impl ReqwestHydrator {
    pub fn new(config: HydratorConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .pool_idle_timeout(config.idle_timeout)
            .danger_accept_invalid_certs(config.tls_insecure)
            .build()
            .map_err(|e| CasseroleError::Origin(e.to_string()))?;
        Ok(Self { config, client })
    }

    fn object_url(&self, url: &Url) -> Result<Url> {
        // Objects are addressed by their full upstream URL; the configured
        // origin is only used when the caller passes a bare path.
        if url.scheme() == "http" || url.scheme() == "https" {
            return Ok(url.clone());
        }
        let joined = format!("{}/{}", self.config.origin.trim_end_matches('/'), url);
        Url::parse(&joined).map_err(CasseroleError::InvalidUrl)
    }
}

#[async_trait::async_trait]
impl Hydrator for ReqwestHydrator {
    async fn get_metadata(&self, url: &Url) -> Result<CacheOutcome> {
        let target = self.object_url(url)?;
        tracing::debug!(url = %target, "probing origin for cacheability");

        let response = self
            .client
            .head(target.clone())
            .send()
            .await
            .map_err(|e| CasseroleError::Origin(e.to_string()))?;

        if response.status() != StatusCode::OK {
            return Err(CasseroleError::NotFound(format!(
                "origin returned {} for {}",
                response.status(),
                target
            )));
        }

        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter(|(name, _)| IDENTITY_HEADERS.contains(&name.as_str()))
            .filter_map(|(name, value)| {
                value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let mut headers = headers;
        let date_retrieved = response
            .headers()
            .get(http::header::DATE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
            .unwrap_or_else(|| httpdate::fmt_http_date(SystemTime::now()));
        headers.insert("x-cache-date-retrieved".to_string(), date_retrieved);

        let total_size = match headers.get("content-length").and_then(|v| v.parse::<u64>().ok()) {
            Some(size) => size,
            None => return Ok(CacheOutcome::Chunked),
        };

        let content_key = casserole_types::generate_content_key(&target, &headers);

        // Cacheability is a verdict for the orchestrator to apply (it also
        // layers its own TTL/Accept-Ranges rules on top), not something the
        // origin client itself rejects on; `decision` is handed back as-is,
        // reasons and all, the same division of labor the original keeps
        // between `hydrator.go` (never rejects) and `memorycache.go` (does).
        let decision = analyze_cacheability(&headers);

        Ok(CacheOutcome::Cached(casserole_types::CacheEntry {
            content_key,
            headers,
            total_size,
            decision,
        }))
    }

    async fn get(&self, url: &Url, start: u64, end: u64) -> Result<Bytes> {
        let target = self.object_url(url)?;
        let range = format!("bytes={}-{}", start, end.saturating_sub(1));
        tracing::debug!(url = %target, range = %range, "fetching block from origin");

        let response = self
            .client
            .get(target)
            .header(http::header::RANGE, range)
            .send()
            .await
            .map_err(|e| CasseroleError::Origin(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CasseroleError::NotFound(format!(
                "origin returned {} for ranged fetch",
                response.status()
            )));
        }

        response.bytes().await.map_err(|e| CasseroleError::Origin(e.to_string()))
    }

    async fn force_get(&self, url: &Url) -> Result<OriginResponse> {
        let target = self.object_url(url)?;
        tracing::debug!(url = %target, "streaming uncacheable object from origin");

        let response = self
            .client
            .get(target)
            .send()
            .await
            .map_err(|e| CasseroleError::Origin(e.to_string()))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let body = Box::pin(response.bytes_stream().map(|chunk| {
            chunk.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
        }));

        Ok(OriginResponse { status, headers, body })
    }
}

/// Turns identity headers into a storability/expiration decision using
/// RFC 7234 semantics, applied to a synthetic GET request against the
/// response we just probed.
fn analyze_cacheability(headers: &HashMap<String, String>) -> CacheDecision {
    let request_parts = match request::Builder::new().method(Method::GET).uri("/").body(()) {
        Ok(req) => req.into_parts().0,
        Err(_) => return CacheDecision::uncacheable("failed to build synthetic request"),
    };

    let mut builder = response::Builder::new().status(StatusCode::OK);
    for (name, value) in headers {
        if let Ok(value) = HeaderValue::from_str(value) {
            builder = builder.header(name.as_str(), value);
        }
    }
    let response_parts = match builder.body(()) {
        Ok(res) => res.into_parts().0,
        Err(_) => return CacheDecision::uncacheable("failed to build synthetic response"),
    };

    let policy = CachePolicy::new(&request_parts, &response_parts);
    if !policy.is_storable() {
        return CacheDecision::uncacheable("response is not storable per cache-control/expires");
    }

    let ttl = policy.time_to_live(SystemTime::now());
    CacheDecision {
        cacheable: true,
        expiration: SystemTime::now() + ttl,
        reasons: Vec::new(),
        warnings: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn no_cache_control_is_still_heuristically_cacheable() {
        let decision = analyze_cacheability(&headers(&[(
            "last-modified",
            "Mon, 01 Jan 2024 00:00:00 GMT",
        )]));
        assert!(decision.cacheable);
    }

    #[test]
    fn no_store_is_uncacheable() {
        let decision =
            analyze_cacheability(&headers(&[("cache-control", "no-store")]));
        assert!(!decision.cacheable);
    }

    #[test]
    fn private_is_uncacheable_for_a_shared_cache() {
        let decision = analyze_cacheability(&headers(&[("cache-control", "private")]));
        assert!(!decision.cacheable);
    }

    #[tokio::test]
    async fn object_url_passes_through_absolute_urls() {
        let hydrator =
            ReqwestHydrator::new(HydratorConfig::new("http://origin.example")).unwrap();
        let absolute = Url::parse("http://other.example/pkg").unwrap();
        assert_eq!(hydrator.object_url(&absolute).unwrap(), absolute);
    }

    #[tokio::test]
    async fn get_metadata_against_a_real_head_response() {
        use wiremock::{
            matchers::{method, path},
            Mock, MockServer, ResponseTemplate,
        };

        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/pkg.tar.gz"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("cache-control", "max-age=3600, public")
                    .insert_header("etag", "\"v1\"")
                    .insert_header("content-length", "5242880")
                    .insert_header("accept-ranges", "bytes"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let hydrator = ReqwestHydrator::new(HydratorConfig::new(server.uri())).unwrap();
        let url = Url::parse(&format!("{}/pkg.tar.gz", server.uri())).unwrap();
        let outcome = hydrator.get_metadata(&url).await.unwrap();

        match outcome {
            CacheOutcome::Cached(entry) => {
                assert_eq!(entry.total_size, 5242880);
                assert!(entry.decision.cacheable);
                assert_eq!(entry.headers.get("etag").map(String::as_str), Some("\"v1\""));
            }
            other => panic!("expected Cached, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn get_metadata_rejects_non_200_head_as_not_found() {
        use wiremock::{
            matchers::{method, path},
            Mock, MockServer, ResponseTemplate,
        };

        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let hydrator = ReqwestHydrator::new(HydratorConfig::new(server.uri())).unwrap();
        let url = Url::parse(&format!("{}/missing", server.uri())).unwrap();
        assert!(matches!(hydrator.get_metadata(&url).await, Err(CasseroleError::NotFound(_))));
    }

    #[tokio::test]
    async fn get_fetches_the_requested_byte_range() {
        use wiremock::{
            matchers::{header, method, path},
            Mock, MockServer, ResponseTemplate,
        };

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pkg.tar.gz"))
            .and(header("range", "bytes=10-19"))
            .respond_with(
                ResponseTemplate::new(206).set_body_bytes(b"0123456789".to_vec()),
            )
            .expect(1)
            .mount(&server)
            .await;

        let hydrator = ReqwestHydrator::new(HydratorConfig::new(server.uri())).unwrap();
        let url = Url::parse(&format!("{}/pkg.tar.gz", server.uri())).unwrap();
        let bytes = hydrator.get(&url, 10, 20).await.unwrap();
        assert_eq!(&bytes[..], b"0123456789");
    }
}
