//! BigQuery REST (`jobs.query` / `jobs.getQueryResults`) warehouse client.

use std::time::Duration;

use async_trait::async_trait;
use crmsync_core::WarehouseRow;
use crmsync_storage::{ApiClient, ApiRequest, FetchError, HttpClientConfig};
use serde_json::{json, Value as JsonValue};
use tracing::debug;

use crate::{json_str, JobHandle, RowPage, Warehouse, WarehouseError};

pub const DEFAULT_BASE_URL: &str = "https://bigquery.googleapis.com";

#[derive(Debug, Clone)]
pub struct BigQueryConfig {
    pub base_url: String,
    pub project_id: String,
    pub location: Option<String>,
    pub access_token: String,
    pub poll_interval: Duration,
    pub http: HttpClientConfig,
}

impl BigQueryConfig {
    pub fn new(project_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            project_id: project_id.into(),
            location: None,
            access_token: access_token.into(),
            poll_interval: Duration::from_secs(1),
            http: HttpClientConfig::default(),
        }
    }
}

#[derive(Debug)]
pub struct BigQueryWarehouse {
    api: ApiClient,
    queries_url: String,
    location: Option<String>,
    poll_interval: Duration,
}

impl BigQueryWarehouse {
    pub fn new(config: BigQueryConfig) -> anyhow::Result<Self> {
        let api = ApiClient::new(HttpClientConfig {
            bearer_token: Some(config.access_token.clone()),
            ..config.http
        })?;
        Ok(Self {
            api,
            queries_url: format!(
                "{}/bigquery/v2/projects/{}/queries",
                config.base_url.trim_end_matches('/'),
                config.project_id
            ),
            location: config.location,
            poll_interval: config.poll_interval,
        })
    }
}

fn rejected_or_transport(err: FetchError) -> WarehouseError {
    match err {
        FetchError::HttpStatus { status, body, .. } if (400..500).contains(&status) => {
            WarehouseError::Rejected(format!("http {status}: {body}"))
        }
        other => WarehouseError::Transport(other),
    }
}

#[async_trait]
impl Warehouse for BigQueryWarehouse {
    async fn open_query(&self, query: &str) -> Result<JobHandle, WarehouseError> {
        let mut body = json!({
            "query": query,
            "useLegacySql": false,
            "maxResults": 0,
        });
        if let Some(location) = &self.location {
            body["location"] = json!(location);
        }

        let resp = self
            .api
            .send_json(&ApiRequest::post(self.queries_url.clone(), body))
            .await
            .map_err(rejected_or_transport)?;

        let job_id = json_str(&resp, &["jobReference", "jobId"])
            .ok_or_else(|| WarehouseError::Response("missing jobReference.jobId".to_string()))?;
        let location = json_str(&resp, &["jobReference", "location"])
            .map(str::to_string)
            .or_else(|| self.location.clone());

        debug!(job_id, ?location, "bigquery job submitted");
        Ok(JobHandle {
            job_id: job_id.to_string(),
            location,
        })
    }

    async fn next_page(
        &self,
        job: &JobHandle,
        page_token: Option<&str>,
        page_size: usize,
    ) -> Result<RowPage, WarehouseError> {
        loop {
            let mut request = ApiRequest::get(format!("{}/{}", self.queries_url, job.job_id))
                .with_query("maxResults", page_size.max(1).to_string())
                .with_query("timeoutMs", "10000");
            if let Some(token) = page_token {
                request = request.with_query("pageToken", token);
            }
            if let Some(location) = &job.location {
                request = request.with_query("location", location.clone());
            }

            let resp = self.api.send_json(&request).await?;
            if let Some(message) = json_str(&resp, &["status", "errorResult", "message"]) {
                return Err(WarehouseError::Rejected(message.to_string()));
            }
            if !resp.get("jobComplete").and_then(JsonValue::as_bool).unwrap_or(true) {
                debug!(job_id = %job.job_id, "bigquery job still running");
                tokio::time::sleep(self.poll_interval).await;
                continue;
            }
            return decode_page(&resp);
        }
    }
}

/// Decode a `getQueryResults` body (`schema.fields` + `rows[].f[].v`) into named rows.
pub fn decode_page(resp: &JsonValue) -> Result<RowPage, WarehouseError> {
    let fields = resp
        .pointer("/schema/fields")
        .and_then(JsonValue::as_array)
        .cloned()
        .unwrap_or_default();
    let rows = resp
        .get("rows")
        .and_then(JsonValue::as_array)
        .map(|rows| {
            rows.iter()
                .map(|row| decode_record(&fields, row))
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()?
        .unwrap_or_default();

    Ok(RowPage {
        rows,
        next_page_token: resp
            .get("pageToken")
            .and_then(JsonValue::as_str)
            .filter(|t| !t.is_empty())
            .map(str::to_string),
    })
}

fn decode_record(fields: &[JsonValue], row: &JsonValue) -> Result<WarehouseRow, WarehouseError> {
    let cells = row
        .get("f")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| WarehouseError::Response("row without cells".to_string()))?;
    if cells.len() != fields.len() {
        return Err(WarehouseError::Response(format!(
            "row has {} cells but schema has {} fields",
            cells.len(),
            fields.len()
        )));
    }

    let mut out = WarehouseRow::new();
    for (field, cell) in fields.iter().zip(cells) {
        let name = field
            .get("name")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| WarehouseError::Response("schema field without name".to_string()))?;
        let value = cell.get("v").cloned().unwrap_or(JsonValue::Null);
        out.insert(name.to_string(), decode_value(field, value)?);
    }
    Ok(out)
}

fn decode_value(field: &JsonValue, value: JsonValue) -> Result<JsonValue, WarehouseError> {
    let repeated = field.get("mode").and_then(JsonValue::as_str) == Some("REPEATED");
    if repeated {
        let items = match value {
            JsonValue::Array(items) => items,
            JsonValue::Null => return Ok(JsonValue::Array(Vec::new())),
            other => {
                return Err(WarehouseError::Response(format!(
                    "repeated field holds non-array {other}"
                )))
            }
        };
        let scalar_field = {
            let mut f = field.clone();
            f["mode"] = json!("NULLABLE");
            f
        };
        return items
            .into_iter()
            .map(|item| {
                let value = item.get("v").cloned().unwrap_or(JsonValue::Null);
                decode_value(&scalar_field, value)
            })
            .collect::<Result<Vec<_>, _>>()
            .map(JsonValue::Array);
    }

    let is_record = matches!(
        field.get("type").and_then(JsonValue::as_str),
        Some("RECORD") | Some("STRUCT")
    );
    if is_record && !value.is_null() {
        let sub_fields = field
            .get("fields")
            .and_then(JsonValue::as_array)
            .cloned()
            .unwrap_or_default();
        let nested = decode_record(&sub_fields, &value)?;
        return Ok(JsonValue::Object(nested.into_iter().collect()));
    }
    Ok(value)
}
