//! Schema registry client and Confluent wire framing.
//!
//! Registry-encoded values are framed as a zero magic byte, the 4-byte
//! big-endian schema id, then the Avro binary datum.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tabkafka_core::{KafkaOutputError, SubjectNameStrategy};
use tracing::{debug, info};

use crate::avsc::TargetSchema;

/// Magic byte opening every framed payload.
pub const MAGIC_BYTE: u8 = 0;

const CONTENT_TYPE: &str = "application/vnd.schemaregistry.v1+json";

/// Registers schemas under subjects.
#[async_trait]
pub trait SchemaRegistry: Send + Sync {
    /// Register `schema` under `subject`, or look up its existing id.
    async fn register(&self, subject: &str, schema: &str) -> Result<u32, KafkaOutputError>;
}

#[derive(Serialize)]
struct RegisterRequest<'a> {
    schema: &'a str,
}

#[derive(Deserialize)]
struct RegisterResponse {
    id: u32,
}

/// Registry reached over its REST API.
#[derive(Debug, Clone)]
pub struct HttpSchemaRegistry {
    base_url: String,
    client: Client,
}

impl HttpSchemaRegistry {
    pub fn new(base_url: &str) -> Result<Self, KafkaOutputError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| KafkaOutputError::config(format!("cannot build registry client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn versions_url(&self, subject: &str) -> String {
        format!("{}/subjects/{}/versions", self.base_url, subject)
    }
}

#[async_trait]
impl SchemaRegistry for HttpSchemaRegistry {
    async fn register(&self, subject: &str, schema: &str) -> Result<u32, KafkaOutputError> {
        let url = self.versions_url(subject);
        debug!("Registering schema at {}", url);
        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
            .json(&RegisterRequest { schema })
            .send()
            .await
            .map_err(|e| {
                KafkaOutputError::connectivity(format!("schema registry unreachable at {url}: {e}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(KafkaOutputError::schema(format!(
                "schema registry rejected subject '{subject}' ({status}): {body}"
            )));
        }
        let registered: RegisterResponse = response.json().await.map_err(|e| {
            KafkaOutputError::schema(format!("unexpected schema registry response: {e}"))
        })?;
        Ok(registered.id)
    }
}

/// Frame an Avro datum with its schema id.
pub fn frame(schema_id: u32, datum: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(5 + datum.len());
    framed.push(MAGIC_BYTE);
    framed.extend_from_slice(&schema_id.to_be_bytes());
    framed.extend_from_slice(datum);
    framed
}

/// Split a framed payload into schema id and datum.
pub fn unframe(payload: &[u8]) -> Option<(u32, &[u8])> {
    match payload {
        [MAGIC_BYTE, a, b, c, d, datum @ ..] => Some((u32::from_be_bytes([*a, *b, *c, *d]), datum)),
        _ => None,
    }
}

/// Schema ids of one task, registered lazily per subject.
pub struct SubjectIds {
    registry: Arc<dyn SchemaRegistry>,
    strategy: SubjectNameStrategy,
    target: Arc<TargetSchema>,
    ids: HashMap<String, u32>,
}

impl SubjectIds {
    pub fn new(
        registry: Arc<dyn SchemaRegistry>,
        strategy: SubjectNameStrategy,
        target: Arc<TargetSchema>,
    ) -> Self {
        Self {
            registry,
            strategy,
            target,
            ids: HashMap::new(),
        }
    }

    /// Schema id for values published to `topic`.
    pub async fn id_for(&mut self, topic: &str) -> Result<u32, KafkaOutputError> {
        let subject = self.strategy.subject(topic, self.target.full_name());
        if let Some(id) = self.ids.get(&subject) {
            return Ok(*id);
        }
        let id = self
            .registry
            .register(&subject, self.target.declaration())
            .await?;
        info!(subject = %subject, id, "Registered value schema");
        self.ids.insert(subject, id);
        Ok(id)
    }
}
