//! HubSpot CRM v3 objects/properties client.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use crmsync_core::ObjectType;
use crmsync_storage::{ApiClient, ApiRequest, HttpClientConfig, RateLimitConfig};
use reqwest::Url;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

use crate::{CrmClient, CrmError, CrmRecord, PropertyDefinition, RecordPage};

pub const DEFAULT_BASE_URL: &str = "https://api.hubapi.com";

/// Private apps get 100 requests per 10 seconds.
pub const DEFAULT_RATE_LIMIT: RateLimitConfig = RateLimitConfig {
    max_requests: 100,
    window: Duration::from_secs(10),
};

#[derive(Debug, Clone)]
pub struct HubSpotConfig {
    pub base_url: String,
    pub access_token: String,
    pub http: HttpClientConfig,
}

impl HubSpotConfig {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            access_token: access_token.into(),
            http: HttpClientConfig {
                rate_limit: Some(DEFAULT_RATE_LIMIT),
                ..Default::default()
            },
        }
    }
}

#[derive(Debug)]
pub struct HubSpotClient {
    api: ApiClient,
    base_url: Url,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    results: Vec<CrmRecord>,
    #[serde(default)]
    paging: Option<Paging>,
}

#[derive(Debug, Deserialize)]
struct Paging {
    next: Option<NextPage>,
}

#[derive(Debug, Deserialize)]
struct NextPage {
    after: String,
}

#[derive(Debug, Deserialize)]
struct PropertiesResponse {
    #[serde(default)]
    results: Vec<PropertyDefinition>,
}

impl HubSpotClient {
    pub fn new(config: HubSpotConfig) -> anyhow::Result<Self> {
        let api = ApiClient::new(HttpClientConfig {
            bearer_token: Some(config.access_token.clone()),
            ..config.http
        })?;
        let base_url = Url::parse(&config.base_url)
            .with_context(|| format!("invalid crm base url {}", config.base_url))?;
        Ok(Self { api, base_url })
    }

    /// Appends `segments` to the base path, percent-encoding each one.
    fn crm_url(&self, segments: &[&str]) -> Result<String, CrmError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| {
                CrmError::Response(format!("crm base url {} cannot take a path", self.base_url))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url.into())
    }

    fn objects_url(&self, object_type: &ObjectType) -> Result<String, CrmError> {
        self.crm_url(&["crm", "v3", "objects", object_type.api_name()])
    }

    async fn patch_object(
        &self,
        object_path: &str,
        id: &str,
        properties: &BTreeMap<String, String>,
    ) -> Result<(), CrmError> {
        let url = self.crm_url(&["crm", "v3", "objects", object_path, id])?;
        self.api
            .send_json(&ApiRequest::patch(url, json!({ "properties": properties })))
            .await?;
        Ok(())
    }

    pub async fn update_contact(
        &self,
        id: &str,
        properties: &BTreeMap<String, String>,
    ) -> Result<(), CrmError> {
        self.patch_object("contacts", id, properties).await
    }

    pub async fn update_company(
        &self,
        id: &str,
        properties: &BTreeMap<String, String>,
    ) -> Result<(), CrmError> {
        self.patch_object("companies", id, properties).await
    }

    pub async fn update_deal(
        &self,
        id: &str,
        properties: &BTreeMap<String, String>,
    ) -> Result<(), CrmError> {
        self.patch_object("deals", id, properties).await
    }

    pub async fn update_ticket(
        &self,
        id: &str,
        properties: &BTreeMap<String, String>,
    ) -> Result<(), CrmError> {
        self.patch_object("tickets", id, properties).await
    }

    /// Custom objects are addressed by their object type id or fully qualified name.
    pub async fn update_custom_object(
        &self,
        object_type_id: &str,
        id: &str,
        properties: &BTreeMap<String, String>,
    ) -> Result<(), CrmError> {
        self.patch_object(object_type_id, id, properties).await
    }
}

#[async_trait]
impl CrmClient for HubSpotClient {
    async fn update_record(
        &self,
        object_type: &ObjectType,
        id: &str,
        properties: &BTreeMap<String, String>,
    ) -> Result<(), CrmError> {
        match object_type {
            ObjectType::Contacts => self.update_contact(id, properties).await,
            ObjectType::Companies => self.update_company(id, properties).await,
            ObjectType::Deals => self.update_deal(id, properties).await,
            ObjectType::Tickets => self.update_ticket(id, properties).await,
            ObjectType::Custom(name) => self.update_custom_object(name, id, properties).await,
        }
    }

    async fn list_records(
        &self,
        object_type: &ObjectType,
        properties: &[String],
        after: Option<&str>,
        limit: usize,
    ) -> Result<RecordPage, CrmError> {
        let mut request = ApiRequest::get(self.objects_url(object_type)?)
            .with_query("limit", limit.clamp(1, 100).to_string())
            .with_query("archived", "false");
        if !properties.is_empty() {
            request = request.with_query("properties", properties.join(","));
        }
        if let Some(after) = after {
            request = request.with_query("after", after);
        }

        let resp = self.api.send_json(&request).await?;
        decode_list(resp)
    }

    async fn list_properties(
        &self,
        object_type: &ObjectType,
    ) -> Result<Vec<PropertyDefinition>, CrmError> {
        let url = self.crm_url(&["crm", "v3", "properties", object_type.api_name()])?;
        let resp = self.api.send_json(&ApiRequest::get(url)).await?;
        let parsed: PropertiesResponse =
            serde_json::from_value(resp).map_err(|e| CrmError::Response(e.to_string()))?;
        Ok(parsed.results)
    }
}

fn decode_list(resp: JsonValue) -> Result<RecordPage, CrmError> {
    let parsed: ListResponse =
        serde_json::from_value(resp).map_err(|e| CrmError::Response(e.to_string()))?;
    Ok(RecordPage {
        records: parsed.results,
        next_after: parsed.paging.and_then(|p| p.next).map(|n| n.after),
    })
}
