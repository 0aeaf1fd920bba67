//! Storage Admin HTTP Adapter
//!
//! Sends administrative commands to the storage cluster's management
//! endpoint as `POST {endpoint}/request` with a JSON command body:
//!
//! ```text
//! {"prefix": "daemon down", "id": 3}
//! ```
//!
//! The endpoint answers with a return code. `-ENOENT` on a state change means
//! the daemon is already gone, which satisfies down, out and purge.

use crate::domain::ports::{AdminCommand, DaemonId, DaemonMembership, StorageAdmin};
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

const ENOENT: i32 = -2;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct AdminConfig {
    /// Management endpoint base URL
    pub endpoint: String,
    /// Bearer token, if the endpoint requires one
    pub token: Option<String>,
    /// Per request timeout
    pub request_timeout: Duration,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://storage-mgr:8003".to_string(),
            token: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

// =============================================================================
// Wire Types
// =============================================================================

#[derive(Debug, Serialize)]
struct CommandRequest<'a> {
    prefix: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    key: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    force: Option<bool>,
}

impl<'a> CommandRequest<'a> {
    fn new(command: AdminCommand) -> Self {
        Self {
            prefix: command.prefix(),
            id: None,
            key: None,
            force: None,
        }
    }

    fn id(mut self, id: DaemonId) -> Self {
        self.id = Some(id.0);
        self
    }

    fn key(mut self, key: &'a str) -> Self {
        self.key = Some(key);
        self
    }

    fn force(mut self, force: bool) -> Self {
        self.force = Some(force);
        self
    }
}

#[derive(Debug, Deserialize)]
struct CommandResponse {
    return_code: i32,
    #[serde(default)]
    status: String,
    #[serde(default)]
    output: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct IdOutput {
    id: u32,
}

// =============================================================================
// Adapter
// =============================================================================

pub struct HttpStorageAdmin {
    config: AdminConfig,
    client: Client,
}

impl HttpStorageAdmin {
    pub fn new(config: AdminConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { config, client })
    }

    fn url(&self) -> String {
        format!("{}/request", self.config.endpoint.trim_end_matches('/'))
    }

    async fn send(
        &self,
        command: AdminCommand,
        request: &CommandRequest<'_>,
    ) -> Result<CommandResponse> {
        debug!("Storage admin request: {:?}", request);
        let mut builder = self.client.post(self.url()).json(request);
        if let Some(token) = &self.config.token {
            builder = builder.bearer_auth(token);
        }
        let response = builder.send().await?.error_for_status()?;
        let body: CommandResponse = response.json().await?;
        if body.return_code != 0 && body.return_code != ENOENT {
            return Err(Error::AdminCommand {
                command: command.to_string(),
                reason: format!("return code {}: {}", body.return_code, body.status),
            });
        }
        Ok(body)
    }

    /// Send a state change where a missing daemon counts as done
    async fn state_change(&self, command: AdminCommand, request: CommandRequest<'_>) -> Result<()> {
        let body = self.send(command, &request).await?;
        if body.return_code == ENOENT {
            debug!("{}: daemon already absent", command);
        }
        Ok(())
    }
}

fn parse_output<T: for<'de> Deserialize<'de>>(body: CommandResponse) -> Result<T> {
    Ok(serde_json::from_value(body.output)?)
}

#[async_trait]
impl StorageAdmin for HttpStorageAdmin {
    async fn register_daemon(&self, replica_key: &str) -> Result<DaemonId> {
        let command = AdminCommand::Register;
        let body = self
            .send(command, &CommandRequest::new(command).key(replica_key))
            .await?;
        if body.return_code == ENOENT {
            return Err(Error::AdminCommand {
                command: command.to_string(),
                reason: format!("no identity returned for {}", replica_key),
            });
        }
        let output: IdOutput = parse_output(body)?;
        info!("Registered daemon {} for {}", output.id, replica_key);
        Ok(DaemonId(output.id))
    }

    async fn lookup_daemon(&self, replica_key: &str) -> Result<Option<DaemonId>> {
        let command = AdminCommand::Lookup;
        let body = self
            .send(command, &CommandRequest::new(command).key(replica_key))
            .await?;
        if body.return_code == ENOENT {
            return Ok(None);
        }
        let output: IdOutput = parse_output(body)?;
        Ok(Some(DaemonId(output.id)))
    }

    async fn daemon_status(&self, id: DaemonId) -> Result<Option<DaemonMembership>> {
        let command = AdminCommand::Status;
        let body = self.send(command, &CommandRequest::new(command).id(id)).await?;
        if body.return_code == ENOENT {
            return Ok(None);
        }
        Ok(Some(parse_output(body)?))
    }

    async fn mark_down(&self, id: DaemonId) -> Result<()> {
        let command = AdminCommand::MarkDown;
        self.state_change(command, CommandRequest::new(command).id(id))
            .await
    }

    async fn mark_out(&self, id: DaemonId) -> Result<()> {
        let command = AdminCommand::MarkOut;
        self.state_change(command, CommandRequest::new(command).id(id))
            .await
    }

    async fn purge(&self, id: DaemonId, force: bool) -> Result<()> {
        let command = AdminCommand::Purge;
        self.state_change(command, CommandRequest::new(command).id(id).force(force))
            .await
    }
}
