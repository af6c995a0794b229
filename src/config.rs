use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Url;
use serde_json::Value;

#[derive(Clone, Debug)]
pub enum RunMode {
    /// Issue a fixed number of requests per worker and then stop.
    Finite { requests_per_worker: usize },
    /// Keep issuing requests until the wall-clock duration elapses.
    Timed { duration: Duration },
}

impl RunMode {
    fn validate(&self) -> Result<()> {
        match self {
            RunMode::Finite {
                requests_per_worker: 0,
            } => Err(anyhow!("finite mode needs at least one request per worker")),
            RunMode::Timed { duration } if duration.is_zero() => {
                Err(anyhow!("timed mode needs a nonzero duration"))
            }
            _ => Ok(()),
        }
    }
}

/// Per-request retry policy: a bounded attempt count with a fixed delay
/// between attempts.
///
/// The delay is a plain parameter so tests can inject a zero-delay policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub delay: Duration,
}

impl RetryPolicy {
    /// `max_attempts` counts the first attempt; it is clamped to at least 1.
    pub fn new(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Give up after the first attempt.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            delay: Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(250),
        }
    }
}

#[derive(Clone, Debug)]
pub struct BenchmarkConfig {
    pub endpoint: Url,
    pub concurrency: usize,
    pub mode: RunMode,
    pub request_body: Value,
    pub per_worker_bodies: Option<Vec<Value>>,
    pub warmup_requests: usize,
    /// When set, a response served by any other model counts as a failure.
    pub expected_model: Option<String>,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    pub headers: HeaderMap,
}

impl BenchmarkConfig {
    pub fn try_new(
        endpoint: impl AsRef<str>,
        api_key: Option<String>,
        concurrency: usize,
        mode: RunMode,
        request_body: Value,
    ) -> Result<Self> {
        if concurrency == 0 {
            return Err(anyhow!("at least one worker is required"));
        }
        mode.validate()?;

        let endpoint = Url::parse(endpoint.as_ref())
            .with_context(|| format!("invalid endpoint URL: {}", endpoint.as_ref()))?;

        Ok(Self {
            endpoint,
            concurrency,
            mode,
            request_body,
            per_worker_bodies: None,
            warmup_requests: 0,
            expected_model: None,
            request_timeout: Duration::from_secs(300),
            retry: RetryPolicy::default(),
            headers: base_headers(api_key.as_deref())?,
        })
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        if !request_timeout.is_zero() {
            self.request_timeout = request_timeout;
        }
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Requests issued before measurement starts; their outcomes are
    /// discarded and never reach the report.
    pub fn with_warmup(mut self, warmup_requests: usize) -> Self {
        self.warmup_requests = warmup_requests;
        self
    }

    pub fn with_expected_model(mut self, model: impl Into<String>) -> Self {
        self.expected_model = Some(model.into());
        self
    }

    pub fn add_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn with_per_worker_bodies(mut self, bodies: Vec<Value>) -> Result<Self> {
        if bodies.len() < self.concurrency {
            return Err(anyhow!(
                "per-worker request bodies length ({}) is less than concurrency ({})",
                bodies.len(),
                self.concurrency
            ));
        }

        self.request_body = bodies
            .first()
            .cloned()
            .unwrap_or_else(|| self.request_body.clone());
        self.per_worker_bodies = Some(bodies);
        Ok(self)
    }

    pub fn request_body_for(&self, worker_id: usize) -> Result<&Value> {
        if let Some(bodies) = &self.per_worker_bodies {
            bodies
                .get(worker_id)
                .ok_or_else(|| anyhow!("no request body configured for worker {}", worker_id))
        } else {
            Ok(&self.request_body)
        }
    }
}

/// Every request carries a JSON content type; a non-empty API key adds the
/// bearer token.
fn base_headers(api_key: Option<&str>) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Some(key) = api_key.filter(|key| !key.is_empty()) {
        let bearer = HeaderValue::from_str(&format!("Bearer {}", key))
            .context("api_key is not a valid header value")?;
        headers.insert(AUTHORIZATION, bearer);
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body() -> Value {
        json!({"model": "m", "messages": []})
    }

    #[test]
    fn rejects_zero_concurrency() {
        let result = BenchmarkConfig::try_new(
            "http://localhost:8000/v1/chat/completions",
            None,
            0,
            RunMode::Finite {
                requests_per_worker: 1,
            },
            body(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn rejects_zero_requests_per_worker() {
        let result = BenchmarkConfig::try_new(
            "http://localhost:8000/v1/chat/completions",
            None,
            1,
            RunMode::Finite {
                requests_per_worker: 0,
            },
            body(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn rejects_zero_duration() {
        let result = BenchmarkConfig::try_new(
            "http://localhost:8000/v1/chat/completions",
            None,
            1,
            RunMode::Timed {
                duration: Duration::ZERO,
            },
            body(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn rejects_malformed_endpoint() {
        let result = BenchmarkConfig::try_new(
            "not a url",
            None,
            1,
            RunMode::Finite {
                requests_per_worker: 1,
            },
            body(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn api_key_becomes_bearer_header() {
        let config = BenchmarkConfig::try_new(
            "http://localhost:8000/v1/chat/completions",
            Some("secret".to_string()),
            1,
            RunMode::Finite {
                requests_per_worker: 1,
            },
            body(),
        )
        .expect("valid config");
        assert_eq!(
            config.headers.get(AUTHORIZATION).map(|v| v.to_str().ok()),
            Some(Some("Bearer secret"))
        );
        assert_eq!(
            config.headers.get(CONTENT_TYPE).map(|v| v.to_str().ok()),
            Some(Some("application/json"))
        );
    }

    #[test]
    fn empty_api_key_leaves_no_auth_header() {
        let config = BenchmarkConfig::try_new(
            "http://localhost:8000/v1/chat/completions",
            Some(String::new()),
            1,
            RunMode::Finite {
                requests_per_worker: 1,
            },
            body(),
        )
        .expect("valid config");
        assert!(config.headers.get(AUTHORIZATION).is_none());
    }

    #[test]
    fn retry_policy_clamps_attempts() {
        let policy = RetryPolicy::new(0, Duration::from_millis(10));
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(RetryPolicy::none().max_attempts, 1);
        assert!(RetryPolicy::none().delay.is_zero());
        assert_eq!(RetryPolicy::default().max_attempts, 3);
    }

    #[test]
    fn per_worker_bodies_must_cover_every_worker() {
        let config = BenchmarkConfig::try_new(
            "http://localhost:8000/v1/chat/completions",
            None,
            3,
            RunMode::Finite {
                requests_per_worker: 1,
            },
            body(),
        )
        .expect("valid config");
        assert!(config
            .clone()
            .with_per_worker_bodies(vec![body(), body()])
            .is_err());

        let config = config
            .with_per_worker_bodies(vec![
                json!({"id": 0}),
                json!({"id": 1}),
                json!({"id": 2}),
            ])
            .expect("enough bodies");
        assert_eq!(config.request_body_for(1).expect("body")["id"], 1);
        assert!(config.request_body_for(3).is_err());
    }

    #[test]
    fn shared_body_serves_every_worker() {
        let config = BenchmarkConfig::try_new(
            "http://localhost:8000/v1/chat/completions",
            None,
            2,
            RunMode::Finite {
                requests_per_worker: 1,
            },
            body(),
        )
        .expect("valid config");
        assert_eq!(config.request_body_for(0).expect("body"), &body());
        assert_eq!(config.request_body_for(1).expect("body"), &body());
    }
}
