use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::config::RuntimeConfig;
use crate::error::FetchError;

/// Upper bound on a server-requested Retry-After wait.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

/// JSON GET client with bounded retries. Rate limits honour `Retry-After`;
/// server errors and dropped connections back off exponentially with jitter.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    max_attempts: u32,
    backoff_base: Duration,
}

impl HttpClient {
    pub fn new(runtime: &RuntimeConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(runtime.request_timeout)
            .user_agent(concat!("gridiron-edge/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            max_attempts: runtime.max_attempts.max(1),
            backoff_base: runtime.backoff_base,
        })
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.backoff_base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let jitter = 1.0 + rand::random::<f64>() * 0.5;
        exp.mul_f64(jitter)
    }

    fn retry_after(resp: &Response) -> Option<Duration> {
        resp.headers()
            .get(reqwest::header::RETRY_AFTER)?
            .to_str()
            .ok()?
            .trim()
            .parse::<u64>()
            .ok()
            .map(|secs| Duration::from_secs(secs).min(MAX_RETRY_AFTER))
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        source_name: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, FetchError> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let last_attempt = attempts >= self.max_attempts;

            let resp = match self.client.get(url).query(query).send().await {
                Ok(resp) => resp,
                Err(error) => {
                    let err = FetchError::Transport {
                        source_name: source_name.to_string(),
                        error: error.without_url(),
                    };
                    if last_attempt || !err.is_transient() {
                        return Err(err);
                    }
                    let wait = self.backoff(attempts);
                    tracing::warn!("{}, retrying in {:?} (attempt {})", err, wait, attempts);
                    tokio::time::sleep(wait).await;
                    continue;
                }
            };

            let status = resp.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                if last_attempt {
                    return Err(FetchError::RateLimited { source_name: source_name.to_string(), attempts });
                }
                let wait = Self::retry_after(&resp).unwrap_or_else(|| self.backoff(attempts));
                tracing::warn!("{} 429 rate-limited, waiting {:?} (attempt {})", source_name, wait, attempts);
                tokio::time::sleep(wait).await;
                continue;
            }

            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                let err = FetchError::Status { source_name: source_name.to_string(), status: status.as_u16(), body };
                if last_attempt || !err.is_transient() {
                    return Err(err);
                }
                let wait = self.backoff(attempts);
                tracing::warn!("{}, retrying in {:?} (attempt {})", err, wait, attempts);
                tokio::time::sleep(wait).await;
                continue;
            }

            let body = resp.text().await.map_err(|error| FetchError::Transport {
                source_name: source_name.to_string(),
                error: error.without_url(),
            })?;
            return serde_json::from_str(&body).map_err(|e| FetchError::Decode {
                source_name: source_name.to_string(),
                reason: e.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_with_bounded_jitter() {
        let runtime = RuntimeConfig { backoff_base: Duration::from_millis(100), ..RuntimeConfig::default() };
        let client = HttpClient::new(&runtime).unwrap();
        for attempt in 1..=3u32 {
            let base = 100u64 * 2u64.pow(attempt - 1);
            let wait = client.backoff(attempt).as_millis() as u64;
            assert!(wait >= base && wait <= base * 3 / 2 + 1, "attempt {} waited {}ms", attempt, wait);
        }
    }

    #[test]
    fn server_errors_are_transient_client_errors_are_not() {
        let status = |code| FetchError::Status { source_name: "x".to_string(), status: code, body: String::new() };
        assert!(status(503).is_transient());
        assert!(!status(404).is_transient());
        assert!(FetchError::RateLimited { source_name: "x".to_string(), attempts: 3 }.is_transient());
    }

    #[tokio::test]
    async fn transport_errors_do_not_leak_the_query_string() {
        let runtime = RuntimeConfig { max_attempts: 1, ..RuntimeConfig::default() };
        let client = HttpClient::new(&runtime).unwrap();
        let err = client
            .get_json::<serde_json::Value>(
                "The Odds API",
                "http://127.0.0.1:1/v4/sports/americanfootball_nfl/odds",
                &[("apiKey", "SECRETKEY123".to_string())],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Transport { .. }));

        let chained = format!("{:#}", anyhow::Error::from(err));
        assert!(!chained.contains("SECRETKEY123"), "{}", chained);
        assert!(!chained.contains("apiKey"), "{}", chained);
        assert_eq!(chained.matches("request to The Odds API failed").count(), 1);
    }
}
