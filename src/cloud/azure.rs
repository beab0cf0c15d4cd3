//! Azure adapter speaking ARM REST
//!
//! Talks directly to the Azure Resource Manager and Monitor endpoints:
//! agent pool reads and resizes under the managed cluster, and the
//! five-minute utilisation window from Azure Monitor. Authentication is
//! either the instance's managed identity (IMDS) or an AAD client-secret
//! grant, with the bearer token cached until shortly before expiry.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{CloudProvider, ClusterUtilization};
use crate::config::AzureConfig;
use crate::Error;

const ARM_ENDPOINT: &str = "https://management.azure.com";
const ARM_SCOPE: &str = "https://management.azure.com/.default";
const ARM_RESOURCE: &str = "https://management.azure.com/";
const IMDS_TOKEN_URL: &str = "http://169.254.169.254/metadata/identity/oauth2/token";

const AGENT_POOL_API_VERSION: &str = "2024-02-01";
const METRICS_API_VERSION: &str = "2018-01-01";

/// Metric names Azure Monitor exposes for managed cluster utilisation
const UTILIZATION_METRICS: &str = "node_cpu_usage_percentage,node_memory_working_set_percentage";

/// Utilisation is averaged over this trailing window
const METRICS_WINDOW_MINUTES: i64 = 5;

/// Tokens are refreshed this long before they would expire
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(2 * 60);

/// Agent pool resize operations are polled at this interval
const PROVISIONING_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Resize operations still pending after this long are reported failed
const PROVISIONING_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: ExpiresIn,
}

/// IMDS returns `expires_in` as a string, the AAD token endpoint as a number
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ExpiresIn {
    Seconds(u64),
    Text(String),
}

impl ExpiresIn {
    fn seconds(&self) -> u64 {
        match self {
            ExpiresIn::Seconds(s) => *s,
            ExpiresIn::Text(s) => s.parse().unwrap_or(300),
        }
    }
}

#[derive(Debug)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct MetricsResponse {
    #[serde(default)]
    value: Vec<Metric>,
}

#[derive(Debug, Deserialize)]
struct Metric {
    name: MetricName,
    #[serde(default)]
    timeseries: Vec<TimeSeries>,
}

#[derive(Debug, Deserialize)]
struct MetricName {
    value: String,
}

#[derive(Debug, Deserialize)]
struct TimeSeries {
    #[serde(default)]
    data: Vec<DataPoint>,
}

#[derive(Debug, Deserialize)]
struct DataPoint {
    average: Option<f64>,
}

/// Size and bounds of one agent pool
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodePoolInfo {
    /// Pool name
    pub name: String,
    /// VM size backing the pool
    pub vm_size: String,
    /// Current desired node count
    pub node_count: u32,
    /// Cloud-side minimum, when the pool has its own autoscaler bounds
    pub min_count: u32,
    /// Cloud-side maximum
    pub max_count: u32,
}

/// Azure implementation of [`CloudProvider`]
#[derive(Debug)]
pub struct AzureCloud {
    config: AzureConfig,
    http: reqwest::Client,
    token: Mutex<Option<CachedToken>>,
}

impl AzureCloud {
    /// Build the adapter for a configured subscription
    pub fn new(config: AzureConfig) -> Result<Self, Error> {
        if config.subscription_id.is_empty() {
            return Err(Error::config(
                "azure.subscriptionId is required for the Azure adapter",
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::cloud(format!("build azure http client: {e}")))?;
        Ok(Self {
            config,
            http,
            token: Mutex::new(None),
        })
    }

    fn cluster_resource_id(&self) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.ContainerService/managedClusters/{}",
            self.config.subscription_id, self.config.resource_group, self.config.cluster_name
        )
    }

    fn agent_pool_url(&self, pool: &str) -> String {
        format!(
            "{ARM_ENDPOINT}{}/agentPools/{pool}?api-version={AGENT_POOL_API_VERSION}",
            self.cluster_resource_id()
        )
    }

    async fn bearer_token(&self) -> Result<String, Error> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() + TOKEN_EXPIRY_MARGIN {
                return Ok(token.value.clone());
            }
        }

        let response = if self.config.use_managed_identity || self.config.client_secret.is_empty()
        {
            self.fetch_managed_identity_token().await?
        } else {
            self.fetch_client_secret_token().await?
        };

        let value = response.access_token.clone();
        *cached = Some(CachedToken {
            value: response.access_token,
            expires_at: Instant::now() + Duration::from_secs(response.expires_in.seconds()),
        });
        Ok(value)
    }

    async fn fetch_managed_identity_token(&self) -> Result<TokenResponse, Error> {
        self.http
            .get(IMDS_TOKEN_URL)
            .header("Metadata", "true")
            .query(&[("api-version", "2018-02-01"), ("resource", ARM_RESOURCE)])
            .send()
            .await
            .map_err(|e| Error::cloud(format!("managed identity token: {e}")))?
            .error_for_status()
            .map_err(|e| Error::cloud(format!("managed identity token: {e}")))?
            .json()
            .await
            .map_err(|e| Error::cloud(format!("managed identity token: {e}")))
    }

    async fn fetch_client_secret_token(&self) -> Result<TokenResponse, Error> {
        let url = format!(
            "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
            self.config.tenant_id
        );
        self.http
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("scope", ARM_SCOPE),
            ])
            .send()
            .await
            .map_err(|e| Error::cloud(format!("client secret token: {e}")))?
            .error_for_status()
            .map_err(|e| Error::cloud(format!("client secret token: {e}")))?
            .json()
            .await
            .map_err(|e| Error::cloud(format!("client secret token: {e}")))
    }

    /// Fetch an agent pool as raw JSON so a resize can round-trip every
    /// field the API returned
    async fn get_pool(&self, pool: &str) -> Result<serde_json::Value, Error> {
        let token = self.bearer_token().await?;
        self.http
            .get(self.agent_pool_url(pool))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| Error::cloud(format!("get agent pool {pool}: {e}")))?
            .error_for_status()
            .map_err(|e| Error::cloud(format!("get agent pool {pool}: {e}")))?
            .json()
            .await
            .map_err(|e| Error::cloud(format!("get agent pool {pool}: {e}")))
    }

    async fn put_pool_count(
        &self,
        pool: &str,
        mut body: serde_json::Value,
        count: u32,
    ) -> Result<(), Error> {
        body["properties"]["count"] = serde_json::json!(count);

        let token = self.bearer_token().await?;
        self.http
            .put(self.agent_pool_url(pool))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::cloud(format!("resize agent pool {pool}: {e}")))?
            .error_for_status()
            .map_err(|e| Error::cloud(format!("resize agent pool {pool}: {e}")))?;

        self.wait_for_provisioning(pool).await
    }

    /// Poll the pool until the resize reaches a terminal provisioning state
    async fn wait_for_provisioning(&self, pool: &str) -> Result<(), Error> {
        let deadline = Instant::now() + PROVISIONING_TIMEOUT;
        loop {
            let body = self.get_pool(pool).await?;
            match provisioning_state(&body) {
                Some("Succeeded") => return Ok(()),
                Some(state @ ("Failed" | "Canceled")) => {
                    return Err(Error::cloud(format!(
                        "agent pool {pool} resize ended in state {state}"
                    )));
                }
                state => {
                    debug!(pool = %pool, state = ?state, "agent pool resize in progress");
                }
            }

            if Instant::now() >= deadline {
                return Err(Error::cloud(format!(
                    "agent pool {pool} resize did not complete in time"
                )));
            }
            tokio::time::sleep(PROVISIONING_POLL_INTERVAL).await;
        }
    }

    /// Read the pool's size and bounds
    pub async fn node_pool_info(&self, pool: &str) -> Result<NodePoolInfo, Error> {
        let body = self.get_pool(pool).await?;
        let props = &body["properties"];
        Ok(NodePoolInfo {
            name: pool.to_string(),
            vm_size: props["vmSize"].as_str().unwrap_or_default().to_string(),
            node_count: props["count"].as_u64().unwrap_or(0) as u32,
            min_count: props["minCount"].as_u64().unwrap_or(0) as u32,
            max_count: props["maxCount"].as_u64().unwrap_or(0) as u32,
        })
    }
}

#[async_trait]
impl CloudProvider for AzureCloud {
    fn enabled(&self) -> bool {
        true
    }

    async fn scale_node_pool(&self, pool: &str, count: u32) -> Result<(), Error> {
        info!(pool = %pool, count = count, "scaling agent pool");
        let body = self.get_pool(pool).await?;
        self.put_pool_count(pool, body, count).await
    }

    async fn delete_node(&self, pool: &str, node: &str) -> Result<(), Error> {
        let body = self.get_pool(pool).await?;
        let count = body["properties"]["count"].as_u64().unwrap_or(0);
        if count <= 1 {
            debug!(pool = %pool, node = %node, "pool at minimum size, not releasing node");
            return Ok(());
        }

        info!(pool = %pool, node = %node, count = count - 1, "releasing node from agent pool");
        self.put_pool_count(pool, body, (count - 1) as u32).await
    }

    async fn cluster_utilization(&self) -> Result<ClusterUtilization, Error> {
        let end = Utc::now();
        let start = end - chrono::Duration::minutes(METRICS_WINDOW_MINUTES);
        let timespan = format!(
            "{}/{}",
            start.to_rfc3339_opts(SecondsFormat::Secs, true),
            end.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        let url = format!(
            "{ARM_ENDPOINT}{}/providers/Microsoft.Insights/metrics",
            self.cluster_resource_id()
        );

        let token = self.bearer_token().await?;
        let response: MetricsResponse = self
            .http
            .get(&url)
            .bearer_auth(token)
            .query(&[
                ("api-version", METRICS_API_VERSION),
                ("metricnames", UTILIZATION_METRICS),
                ("timespan", timespan.as_str()),
                ("interval", "PT1M"),
                ("aggregation", "Average"),
            ])
            .send()
            .await
            .map_err(|e| Error::cloud(format!("query cluster metrics: {e}")))?
            .error_for_status()
            .map_err(|e| Error::cloud(format!("query cluster metrics: {e}")))?
            .json()
            .await
            .map_err(|e| Error::cloud(format!("query cluster metrics: {e}")))?;

        Ok(parse_utilization(&response))
    }
}

fn provisioning_state(pool: &serde_json::Value) -> Option<&str> {
    pool["properties"]["provisioningState"].as_str()
}

/// Reduce the Monitor response to utilisation fractions
///
/// Each series carries percent values at one-minute grain; the most
/// recent non-null average wins, rescaled from percent to a fraction.
fn parse_utilization(response: &MetricsResponse) -> ClusterUtilization {
    let mut util = ClusterUtilization::default();

    for metric in &response.value {
        let mut latest = None;
        for series in &metric.timeseries {
            for point in &series.data {
                if let Some(average) = point.average {
                    latest = Some(average);
                }
            }
        }
        let Some(percent) = latest else { continue };

        match metric.name.value.as_str() {
            "node_cpu_usage_percentage" => util.cpu = percent / 100.0,
            "node_memory_working_set_percentage" => util.memory = percent / 100.0,
            _ => {}
        }
    }

    util
}
