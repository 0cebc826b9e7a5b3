//! REST lookups around a livestream: the room list, one room's display
//! metadata, and the clinic services a host can promote on stream.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::LiveConfig;
use crate::error::DirectoryError;

/// Every endpoint answers with this wrapper.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiEnvelope<T> {
    pub success: bool,
    pub value: Option<T>,
    #[serde(default)]
    pub error: Option<Value>,
}

impl<T> ApiEnvelope<T> {
    pub fn into_result(self) -> Result<T, DirectoryError> {
        if !self.success {
            return Err(DirectoryError::Rejected(describe_error(self.error)));
        }
        self.value
            .ok_or_else(|| DirectoryError::Rejected("response carried no value".to_string()))
    }
}

fn describe_error(error: Option<Value>) -> String {
    match error {
        Some(Value::String(s)) => s,
        Some(Value::Object(map)) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Value::Object(map.clone()).to_string()),
        Some(other) => other.to_string(),
        None => "unknown error".to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub room_id: String,
    pub title: String,
    #[serde(default)]
    pub clinic_id: Option<String>,
    #[serde(default)]
    pub clinic_name: Option<String>,
    #[serde(default)]
    pub viewer_count: u32,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

/// What the stage shows about the room it is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMetadata {
    pub room_id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub clinic_name: Option<String>,
    #[serde(default)]
    pub host_name: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotableService {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub duration_minutes: Option<u32>,
}

#[async_trait]
pub trait RoomDirectory: Send + Sync {
    async fn list_rooms(&self) -> Result<Vec<RoomSummary>, DirectoryError>;
    async fn room_metadata(&self, room_id: &str) -> Result<RoomMetadata, DirectoryError>;
    async fn list_promotable_services(&self, clinic_id: &str) -> Result<Vec<PromotableService>, DirectoryError>;
}

pub struct HttpRoomDirectory {
    client: Client,
    api_base: String,
    access_token: Option<String>,
}

impl HttpRoomDirectory {
    pub fn new(api_base: &str) -> Self {
        Self {
            client: Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            access_token: None,
        }
    }

    pub fn from_config(config: &LiveConfig) -> Self {
        let mut directory = Self::new(&config.api_base);
        directory.access_token = config.access_token.clone();
        directory
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, DirectoryError> {
        let url = format!("{}{}", self.api_base, path);
        debug!("GET {}", url);

        let mut request = self.client.get(&url);
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(DirectoryError::Rejected(format!("{}: {}", status, body)));
        }

        response.json::<ApiEnvelope<T>>().await?.into_result()
    }
}

#[async_trait]
impl RoomDirectory for HttpRoomDirectory {
    async fn list_rooms(&self) -> Result<Vec<RoomSummary>, DirectoryError> {
        self.get("/livestream/rooms").await
    }

    async fn room_metadata(&self, room_id: &str) -> Result<RoomMetadata, DirectoryError> {
        self.get(&format!("/livestream/rooms/{}", room_id)).await
    }

    async fn list_promotable_services(&self, clinic_id: &str) -> Result<Vec<PromotableService>, DirectoryError> {
        self.get(&format!("/clinics/{}/services/promotable", clinic_id)).await
    }
}
