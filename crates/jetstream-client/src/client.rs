//! JetStream API client
//!
//! Implements the JetStream management API over NATS request/reply.
//! Based on the JetStream API subject layout: `$JS.API.STREAM.*`,
//! `$JS.API.CONSUMER.*`, `$JS.API.STREAM.TEMPLATE.*` and `$JS.API.INFO`.

use crate::config::ConnectionConfig;
use crate::error::JetStreamError;
use crate::jetstream_trait::JetStreamClientTrait;
use crate::models::*;
use async_nats::connection::State;
use async_nats::{ConnectErrorKind, ConnectOptions, RequestErrorKind, ServerAddr};
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

/// Default JetStream API subject prefix
pub const API_PREFIX: &str = "$JS.API";

/// JetStream API client
pub struct JetStreamClient {
    client: async_nats::Client,
    servers: Vec<String>,
    prefix: String,
}

impl std::fmt::Debug for JetStreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JetStreamClient")
            .field("servers", &self.servers)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl JetStreamClient {
    /// Open an authenticated connection
    ///
    /// # Returns
    /// * `Ok(JetStreamClient)` - Connected client
    /// * `Err(JetStreamError::Authentication)` - Credentials were rejected
    /// * `Err(JetStreamError::Connection)` - Servers unreachable or TLS failure
    pub async fn connect(config: &ConnectionConfig) -> Result<Self, JetStreamError> {
        if config.servers.is_empty() {
            return Err(JetStreamError::InvalidRequest(
                "no NATS servers configured".to_string(),
            ));
        }

        let addrs = config
            .servers
            .iter()
            .map(|s| s.parse::<ServerAddr>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| JetStreamError::InvalidRequest(format!("invalid server URL: {}", e)))?;

        let mut options = ConnectOptions::new()
            .name(&config.client_name)
            .request_timeout(Some(config.request_timeout))
            .max_reconnects(None::<usize>);

        if let Some(creds) = &config.credentials_file {
            options = options.credentials_file(creds).await?;
        }
        if let Some(seed_file) = &config.nkey_seed_file {
            let seed = tokio::fs::read_to_string(seed_file).await?;
            options = options.nkey(seed.trim().to_string());
        }

        let mut tls = false;
        match (&config.tls_client_cert, &config.tls_client_key) {
            (Some(cert), Some(key)) => {
                options = options.add_client_certificate(cert.clone(), key.clone());
                tls = true;
            }
            (None, None) => {}
            _ => {
                return Err(JetStreamError::InvalidRequest(
                    "TLS client certificate and key must be set together".to_string(),
                ));
            }
        }
        for ca in &config.tls_root_cas {
            options = options.add_root_certificates(ca.clone());
            tls = true;
        }
        if tls {
            options = options.require_tls(true);
        }
        if config.tls_first {
            options = options.tls_first();
        }

        debug!("Connecting to NATS at {}", config.servers_display());
        let client = options.connect(addrs.as_slice()).await.map_err(|e| match e.kind() {
            ConnectErrorKind::Authentication | ConnectErrorKind::AuthorizationViolation => {
                JetStreamError::Authentication(e.to_string())
            }
            ConnectErrorKind::ServerParse => JetStreamError::InvalidRequest(e.to_string()),
            _ => JetStreamError::Connection(e.to_string()),
        })?;
        info!("Connected to NATS at {}", config.servers_display());

        Ok(Self {
            client,
            servers: config.servers.clone(),
            prefix: API_PREFIX.to_string(),
        })
    }

    /// Send one API request and decode the reply envelope
    async fn request<B, T>(&self, subject: String, body: Option<&B>) -> Result<T, JetStreamError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let payload = match body {
            Some(body) => Bytes::from(serde_json::to_vec(body)?),
            None => Bytes::new(),
        };
        debug!("JetStream API request {}", subject);

        let message = self
            .client
            .request(subject.clone(), payload)
            .await
            .map_err(|e| match e.kind() {
                RequestErrorKind::TimedOut => JetStreamError::Timeout(subject.clone()),
                RequestErrorKind::NoResponders => JetStreamError::Api {
                    code: 503,
                    err_code: 0,
                    description: format!("no responders on {}: JetStream unavailable", subject),
                },
                _ => JetStreamError::Connection(e.to_string()),
            })?;

        match serde_json::from_slice::<ApiResponse<T>>(&message.payload)? {
            ApiResponse::Ok(value) => Ok(value),
            ApiResponse::Err { error } => Err(JetStreamError::Api {
                code: error.code,
                err_code: error.err_code,
                description: error.description,
            }),
        }
    }

    fn subject(&self, parts: &[&str]) -> String {
        let mut subject = self.prefix.clone();
        for part in parts {
            subject.push('.');
            subject.push_str(part);
        }
        subject
    }

    async fn account_info(&self) -> Result<AccountInfo, JetStreamError> {
        self.request::<(), AccountInfo>(self.subject(&["INFO"]), None).await
    }

    /// Adopt the connected account, verifying its limits.
    ///
    /// Accounts are provisioned by the server configuration or the account
    /// resolver, so the only thing a client can do is confirm the account
    /// looks the way the caller expects.
    async fn verify_account(&self, name: &str, limits: &AccountLimits) -> Result<AccountInfo, JetStreamError> {
        let info = self.account_info().await?;
        if info.limits != *limits {
            return Err(JetStreamError::Unsupported(format!(
                "account {} limits are set by the NATS server (server reports {:?}, requested {:?})",
                name, info.limits, limits
            )));
        }
        Ok(info)
    }
}

/// Entity names become subject tokens and must not contain wildcards or separators
fn validate_name(kind: &str, name: &str) -> Result<(), JetStreamError> {
    if name.is_empty()
        || name
            .chars()
            .any(|c| c == '.' || c == '*' || c == '>' || c.is_whitespace())
    {
        return Err(JetStreamError::InvalidRequest(format!(
            "invalid {} name {:?}",
            kind, name
        )));
    }
    Ok(())
}

/// Map "not found" replies to `None`
fn found<T>(result: Result<T, JetStreamError>) -> Result<Option<T>, JetStreamError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Map delete replies, treating "not found" as nothing deleted
fn deleted(result: Result<DeleteResponse, JetStreamError>) -> Result<bool, JetStreamError> {
    match result {
        Ok(resp) => Ok(resp.success),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

#[async_trait::async_trait]
impl JetStreamClientTrait for JetStreamClient {
    fn servers(&self) -> &[String] {
        &self.servers
    }

    fn is_connected(&self) -> bool {
        matches!(self.client.connection_state(), State::Connected)
    }

    async fn get_account(&self, _name: &str) -> Result<Option<AccountInfo>, JetStreamError> {
        match self.account_info().await {
            Ok(info) => Ok(Some(info)),
            Err(e) if e.is_jetstream_disabled() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_account(&self, name: &str, limits: &AccountLimits) -> Result<AccountInfo, JetStreamError> {
        self.verify_account(name, limits).await
    }

    async fn update_account(&self, name: &str, limits: &AccountLimits) -> Result<AccountInfo, JetStreamError> {
        self.verify_account(name, limits).await
    }

    async fn delete_account(&self, name: &str) -> Result<bool, JetStreamError> {
        debug!("Releasing account {}; nothing to delete on the broker", name);
        Ok(false)
    }

    async fn get_stream(&self, name: &str) -> Result<Option<StreamInfo>, JetStreamError> {
        validate_name("stream", name)?;
        found(self.request::<(), StreamInfo>(self.subject(&["STREAM", "INFO", name]), None).await)
    }

    async fn create_stream(&self, config: &StreamConfig) -> Result<StreamInfo, JetStreamError> {
        validate_name("stream", &config.name)?;
        self.request(self.subject(&["STREAM", "CREATE", &config.name]), Some(config))
            .await
    }

    async fn update_stream(&self, config: &StreamConfig) -> Result<StreamInfo, JetStreamError> {
        validate_name("stream", &config.name)?;
        self.request(self.subject(&["STREAM", "UPDATE", &config.name]), Some(config))
            .await
    }

    async fn delete_stream(&self, name: &str) -> Result<bool, JetStreamError> {
        validate_name("stream", name)?;
        deleted(self.request::<(), DeleteResponse>(self.subject(&["STREAM", "DELETE", name]), None).await)
    }

    async fn get_consumer(&self, stream: &str, name: &str) -> Result<Option<ConsumerInfo>, JetStreamError> {
        validate_name("stream", stream)?;
        validate_name("consumer", name)?;
        found(
            self.request::<(), ConsumerInfo>(self.subject(&["CONSUMER", "INFO", stream, name]), None)
                .await,
        )
    }

    async fn create_consumer(&self, stream: &str, config: &ConsumerConfig) -> Result<ConsumerInfo, JetStreamError> {
        write_consumer(self, stream, config, "create").await
    }

    async fn update_consumer(&self, stream: &str, config: &ConsumerConfig) -> Result<ConsumerInfo, JetStreamError> {
        write_consumer(self, stream, config, "update").await
    }

    async fn delete_consumer(&self, stream: &str, name: &str) -> Result<bool, JetStreamError> {
        validate_name("stream", stream)?;
        validate_name("consumer", name)?;
        deleted(
            self.request::<(), DeleteResponse>(self.subject(&["CONSUMER", "DELETE", stream, name]), None)
                .await,
        )
    }

    async fn get_stream_template(&self, name: &str) -> Result<Option<StreamTemplateInfo>, JetStreamError> {
        validate_name("stream template", name)?;
        found(
            self.request::<(), StreamTemplateInfo>(self.subject(&["STREAM", "TEMPLATE", "INFO", name]), None)
                .await,
        )
    }

    async fn create_stream_template(&self, config: &StreamTemplateConfig) -> Result<StreamTemplateInfo, JetStreamError> {
        validate_name("stream template", &config.name)?;
        self.request(self.subject(&["STREAM", "TEMPLATE", "CREATE", &config.name]), Some(config))
            .await
    }

    async fn delete_stream_template(&self, name: &str) -> Result<bool, JetStreamError> {
        validate_name("stream template", name)?;
        deleted(
            self.request::<(), DeleteResponse>(self.subject(&["STREAM", "TEMPLATE", "DELETE", name]), None)
                .await,
        )
    }
}

async fn write_consumer(
    client: &JetStreamClient,
    stream: &str,
    config: &ConsumerConfig,
    action: &'static str,
) -> Result<ConsumerInfo, JetStreamError> {
    validate_name("stream", stream)?;
    let Some(durable) = config.durable_name.as_deref() else {
        return Err(JetStreamError::InvalidRequest(
            "consumer durable name is required".to_string(),
        ));
    };
    validate_name("consumer", durable)?;
    let body = CreateConsumerRequest {
        stream_name: stream,
        config,
        action,
    };
    client
        .request(client.subject(&["CONSUMER", "CREATE", stream, durable]), Some(&body))
        .await
}
