use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{PoolError, Result};
use crate::models::ExecutorIdentity;

/// Handshake response from an executor's pool endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverReport {
    pub version: String,
    pub pool_fingerprint: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageResponse {
    hosts: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UtilizeRequest<'a> {
    host: &'a str,
    label: &'a str,
}

/// RPC surface the orchestrator drives against one executor.
#[async_trait]
pub trait ExecutorClient: Send + Sync {
    /// Compatibility probe; detects an executor that is not (yet, or no
    /// longer) a member of this pool.
    async fn discover(&self, executor: &ExecutorIdentity) -> Result<DiscoverReport>;

    /// The executor's self-reported in-use host names.
    async fn report_usage(&self, executor: &ExecutorIdentity) -> Result<Vec<String>>;

    /// Notify the executor that its reservation of `host` is now active.
    async fn utilize_host(&self, executor: &ExecutorIdentity, host: &str, label: &str)
        -> Result<()>;
}

/// reqwest-backed client. Calls are blocking-with-timeout and are never made
/// while any engine or inventory lock is held.
pub struct HttpExecutorClient {
    http: reqwest::Client,
    token: String,
}

impl HttpExecutorClient {
    pub fn new(token: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| PoolError::Communication {
                url: "<client>".into(),
                reason: e.to_string(),
            })?;
        Ok(Self::with_client(http, token))
    }

    pub fn with_client(http: reqwest::Client, token: impl Into<String>) -> Self {
        Self {
            http,
            token: token.into(),
        }
    }

    fn endpoint(executor: &ExecutorIdentity, path: &str) -> String {
        format!("{}/pool/{path}", executor.base_url.trim_end_matches('/'))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        executor: &ExecutorIdentity,
        path: &str,
    ) -> Result<T> {
        let url = Self::endpoint(executor, path);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| PoolError::Communication {
                url: url.clone(),
                reason: e.to_string(),
            })?;
        let response = check_status(&url, response).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| PoolError::Protocol {
                url,
                reason: format!("undecodable response body: {e}"),
            })
    }
}

/// Map HTTP failures into the taxonomy: 401/403 carry the server's reason
/// and are never retried; everything else non-2xx is transient.
async fn check_status(url: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        let reason = response.text().await.unwrap_or_default();
        return Err(PoolError::PermissionDenied {
            url: url.to_string(),
            reason: if reason.trim().is_empty() {
                format!("HTTP {status}")
            } else {
                reason
            },
        });
    }
    if !status.is_success() {
        return Err(PoolError::Communication {
            url: url.to_string(),
            reason: format!("HTTP {status}"),
        });
    }
    Ok(response)
}

#[async_trait]
impl ExecutorClient for HttpExecutorClient {
    async fn discover(&self, executor: &ExecutorIdentity) -> Result<DiscoverReport> {
        self.get_json(executor, "discover").await
    }

    async fn report_usage(&self, executor: &ExecutorIdentity) -> Result<Vec<String>> {
        let usage: UsageResponse = self.get_json(executor, "usage").await?;
        Ok(usage.hosts)
    }

    async fn utilize_host(
        &self,
        executor: &ExecutorIdentity,
        host: &str,
        label: &str,
    ) -> Result<()> {
        let url = Self::endpoint(executor, "utilize");
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(&UtilizeRequest { host, label })
            .send()
            .await
            .map_err(|e| PoolError::Communication {
                url: url.clone(),
                reason: e.to_string(),
            })?;
        check_status(&url, response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discover_report_wire_shape() {
        let report: DiscoverReport = serde_json::from_str(
            r#"{"version":"2.401.3","poolFingerprint":"a1b2c3d4e5f60718"}"#,
        )
        .unwrap();
        assert_eq!(report.version, "2.401.3");
        assert_eq!(report.pool_fingerprint, "a1b2c3d4e5f60718");
    }

    #[test]
    fn usage_response_wire_shape() {
        let usage: UsageResponse =
            serde_json::from_str(r#"{"hosts":["winA","solB"]}"#).unwrap();
        assert_eq!(usage.hosts, vec!["winA", "solB"]);
    }

    #[test]
    fn utilize_request_wire_shape() {
        let body = serde_json::to_string(&UtilizeRequest {
            host: "solB",
            label: "solaris",
        })
        .unwrap();
        assert_eq!(body, r#"{"host":"solB","label":"solaris"}"#);
    }

    #[test]
    fn endpoint_tolerates_trailing_slash() {
        let executor = ExecutorIdentity::new("ci", "https://ci.example.com/", "p");
        assert_eq!(
            HttpExecutorClient::endpoint(&executor, "usage"),
            "https://ci.example.com/pool/usage"
        );
    }
}

/// Canned in-process client for engine and verifier tests.
#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct StaticClient {
        usage: Mutex<HashMap<String, std::result::Result<Vec<String>, String>>>,
        utilized: Mutex<Vec<(String, String)>>,
    }

    impl StaticClient {
        pub fn set_usage(&self, executor: &str, hosts: &[&str]) {
            self.usage.lock().unwrap().insert(
                executor.to_string(),
                Ok(hosts.iter().map(|h| h.to_string()).collect()),
            );
        }

        pub fn fail_usage(&self, executor: &str, reason: &str) {
            self.usage
                .lock()
                .unwrap()
                .insert(executor.to_string(), Err(reason.to_string()));
        }

        /// `(executor name, host)` pairs in notification order.
        pub fn utilized(&self) -> Vec<(String, String)> {
            self.utilized.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ExecutorClient for StaticClient {
        async fn discover(&self, executor: &ExecutorIdentity) -> Result<DiscoverReport> {
            Ok(DiscoverReport {
                version: "test".into(),
                pool_fingerprint: executor.pool_fingerprint.clone(),
            })
        }

        async fn report_usage(&self, executor: &ExecutorIdentity) -> Result<Vec<String>> {
            match self.usage.lock().unwrap().get(&executor.name) {
                Some(Ok(hosts)) => Ok(hosts.clone()),
                Some(Err(reason)) => Err(PoolError::Communication {
                    url: executor.base_url.clone(),
                    reason: reason.clone(),
                }),
                None => Ok(Vec::new()),
            }
        }

        async fn utilize_host(
            &self,
            executor: &ExecutorIdentity,
            host: &str,
            _label: &str,
        ) -> Result<()> {
            self.utilized
                .lock()
                .unwrap()
                .push((executor.name.clone(), host.to_string()));
            Ok(())
        }
    }
}
