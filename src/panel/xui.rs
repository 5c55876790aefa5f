//! x-ui panel client.
//!
//! Clients of an inbound live inside the inbound's `settings` field, a JSON
//! document stored as a string. Every change is a read-modify-write of the
//! whole inbound, patching `serde_json::Value`s so fields this crate does not
//! know about survive the round trip.

use super::{GatewayProxy, PanelError, RemoteIdentity};
use crate::config::PanelConfig;
use crate::identity::Identity;
use async_trait::async_trait;
use reqwest::header::{COOKIE, SET_COOKIE};
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const SESSION_COOKIE: &str = "3x-ui";
const RESET_SUFFIX: &str = "-reset";

/// Standard x-ui API envelope.
#[derive(Debug, Deserialize)]
struct Envelope {
    success: bool,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    obj: Value,
}

/// Gateway proxy backed by one x-ui inbound.
pub struct XuiPanel {
    config: PanelConfig,
    client: Client,
    session: Mutex<Option<String>>,
    /// Serializes read-modify-write cycles on the inbound.
    writes: Mutex<()>,
    apply_delay: Duration,
}

impl XuiPanel {
    /// Create a new panel client. No request is made until first use.
    pub fn new(config: PanelConfig) -> Result<Self, PanelError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;

        Ok(Self {
            apply_delay: Duration::from_millis(config.apply_delay_ms),
            config,
            client,
            session: Mutex::new(None),
            writes: Mutex::new(()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.url, path)
    }

    async fn login(&self) -> Result<String, PanelError> {
        debug!(url = %self.config.url, "Logging in to panel");

        let response = self
            .client
            .post(self.url("login"))
            .json(&json!({
                "username": self.config.username,
                "password": self.config.password,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(PanelError::Auth(format!("HTTP {}", response.status())));
        }

        let cookie = session_cookie(
            response
                .headers()
                .get_all(SET_COOKIE)
                .iter()
                .filter_map(|v| v.to_str().ok()),
        );

        let envelope: Envelope = response
            .json()
            .await
            .map_err(|e| PanelError::InvalidResponse(format!("Failed to parse login response: {}", e)))?;

        if !envelope.success {
            return Err(PanelError::Auth(envelope.msg));
        }

        let cookie = cookie.ok_or_else(|| PanelError::Auth("session cookie missing from login response".to_string()))?;
        info!(url = %self.config.url, "Panel session established");
        Ok(cookie)
    }

    async fn session_cookie(&self) -> Result<String, PanelError> {
        let mut session = self.session.lock().await;
        if let Some(cookie) = session.as_ref() {
            return Ok(cookie.clone());
        }
        let cookie = self.login().await?;
        *session = Some(cookie.clone());
        Ok(cookie)
    }

    async fn invalidate_session(&self) {
        *self.session.lock().await = None;
    }

    /// Authenticated API call, logging in again once if the session is rejected.
    async fn call(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value, PanelError> {
        for attempt in 0..2 {
            let cookie = self.session_cookie().await?;
            let mut request = self
                .client
                .request(method.clone(), self.url(path))
                .header(COOKIE, cookie);
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = request.send().await?;
            let status = response.status();

            if status == StatusCode::UNAUTHORIZED && attempt == 0 {
                warn!(path, "Panel session expired, logging in again");
                self.invalidate_session().await;
                continue;
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(PanelError::Status {
                    status: status.as_u16(),
                    body,
                });
            }

            let envelope: Envelope = response
                .json()
                .await
                .map_err(|e| PanelError::InvalidResponse(format!("Failed to parse response: {}", e)))?;

            if !envelope.success {
                if attempt == 0 {
                    warn!(path, msg = %envelope.msg, "Panel rejected request, retrying with a new session");
                    self.invalidate_session().await;
                    continue;
                }
                return Err(PanelError::Rejected(envelope.msg));
            }

            return Ok(envelope.obj);
        }

        Err(PanelError::Auth("session rejected after re-login".to_string()))
    }

    async fn get_inbound(&self) -> Result<Value, PanelError> {
        let path = format!("panel/api/inbounds/get/{}", self.config.inbound_id);
        let inbound = self.call(Method::GET, &path, None).await?;
        if !inbound.is_object() {
            return Err(PanelError::InvalidResponse("inbound is not an object".to_string()));
        }
        Ok(inbound)
    }

    async fn update_inbound(&self, inbound: &Value) -> Result<(), PanelError> {
        let path = format!("panel/api/inbounds/update/{}", self.config.inbound_id);
        self.call(Method::POST, &path, Some(inbound)).await?;
        Ok(())
    }

    /// Rename the inbound remark away and back so the proxy core reloads it.
    async fn hard_reset(&self) -> Result<(), PanelError> {
        let mut inbound = self.get_inbound().await?;
        let remark = inbound
            .get("remark")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let base = base_remark(&remark).to_string();

        inbound["remark"] = Value::String(format!("{}{}", base, RESET_SUFFIX));
        self.update_inbound(&inbound).await?;

        tokio::time::sleep(self.apply_delay / 2).await;

        inbound["remark"] = Value::String(base);
        self.update_inbound(&inbound).await?;

        debug!(inbound_id = self.config.inbound_id, "Inbound hard reset");
        Ok(())
    }

    async fn set_enabled(&self, identity: &Identity, enabled: bool) -> Result<(), PanelError> {
        let _write = self.writes.lock().await;

        let mut inbound = self.get_inbound().await?;
        patch_client(&mut inbound, identity, |client| {
            client.insert("enable".to_string(), Value::Bool(enabled));
        })?;
        self.update_inbound(&inbound).await?;
        self.hard_reset().await?;

        info!(identity = %identity, enabled, "Panel identity updated");
        Ok(())
    }
}

#[async_trait]
impl GatewayProxy for XuiPanel {
    async fn list_identities(&self) -> Result<Vec<RemoteIdentity>, PanelError> {
        let inbound = self.get_inbound().await?;
        roster(&inbound)
    }

    async fn enable(&self, identity: &Identity) -> Result<(), PanelError> {
        self.set_enabled(identity, true).await
    }

    async fn disable(&self, identity: &Identity) -> Result<(), PanelError> {
        self.set_enabled(identity, false).await
    }

    /// Phases, each a full inbound write:
    /// - A: disable, mark depleted/exhausted, rename the email with a
    ///   `-reset` suffix and rotate the client id. The rename forces the
    ///   proxy core to drop the old client entry.
    /// - B: restore the email, still disabled and exhausted.
    /// - C: hard reset of the inbound remark.
    ///
    /// Client lookup accepts the suffixed email, so a retry after a failure
    /// between A and B starts over cleanly.
    async fn aggressive_reset(&self, identity: &Identity) -> Result<String, PanelError> {
        let _write = self.writes.lock().await;

        let credential = uuid::Uuid::new_v4().to_string();
        let reset_email = format!("{}{}", identity, RESET_SUFFIX);

        let mut inbound = self.get_inbound().await?;
        patch_client(&mut inbound, identity, |client| {
            mark_exhausted(client);
            client.insert("email".to_string(), Value::String(reset_email.clone()));
            client.insert("id".to_string(), Value::String(credential.clone()));
        })?;
        self.update_inbound(&inbound).await?;

        tokio::time::sleep(self.apply_delay).await;

        patch_client(&mut inbound, identity, |client| {
            mark_exhausted(client);
            client.insert("email".to_string(), Value::String(identity.to_string()));
        })?;
        self.update_inbound(&inbound).await?;

        self.hard_reset().await?;

        info!(identity = %identity, "Aggressive reset applied");
        Ok(credential)
    }
}

fn mark_exhausted(client: &mut Map<String, Value>) {
    client.insert("enable".to_string(), Value::Bool(false));
    client.insert("depleted".to_string(), Value::Bool(true));
    client.insert("exhausted".to_string(), Value::Bool(true));
}

/// Value of the session cookie among `Set-Cookie` headers, as `name=value`.
fn session_cookie<'a>(headers: impl Iterator<Item = &'a str>) -> Option<String> {
    headers
        .filter_map(|h| h.split(';').next())
        .map(str::trim)
        .find(|pair| {
            pair.split_once('=')
                .map(|(name, _)| name == SESSION_COOKIE)
                .unwrap_or(false)
        })
        .map(str::to_string)
}

/// Remark without the transient reset suffix.
fn base_remark(remark: &str) -> &str {
    remark.strip_suffix(RESET_SUFFIX).unwrap_or(remark)
}

/// Canonical identity for a client email, folding a leftover reset suffix.
fn canonical_email(email: &str) -> &str {
    email.strip_suffix(RESET_SUFFIX).unwrap_or(email)
}

fn parse_settings(inbound: &Value) -> Result<Map<String, Value>, PanelError> {
    let raw = inbound
        .get("settings")
        .and_then(Value::as_str)
        .ok_or_else(|| PanelError::InvalidResponse("inbound settings missing".to_string()))?;

    match serde_json::from_str(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(PanelError::InvalidResponse("inbound settings is not an object".to_string())),
        Err(e) => Err(PanelError::InvalidResponse(format!("inbound settings: {}", e))),
    }
}

/// Identities on the inbound.
fn roster(inbound: &Value) -> Result<Vec<RemoteIdentity>, PanelError> {
    let settings = parse_settings(inbound)?;
    let clients = settings
        .get("clients")
        .and_then(Value::as_array)
        .ok_or_else(|| PanelError::InvalidResponse("clients missing from settings".to_string()))?;

    Ok(clients
        .iter()
        .filter_map(|client| {
            let email = client.get("email")?.as_str()?;
            if email.is_empty() {
                return None;
            }
            Some(RemoteIdentity {
                identity: Identity::from(canonical_email(email)),
                enabled: client.get("enable").and_then(Value::as_bool).unwrap_or(false),
                credential: client
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            })
        })
        .collect())
}

/// Apply `patch` to the client matching `identity` and write the settings back.
fn patch_client(
    inbound: &mut Value,
    identity: &Identity,
    patch: impl FnOnce(&mut Map<String, Value>),
) -> Result<(), PanelError> {
    let mut settings = parse_settings(inbound)?;

    let clients = settings
        .get_mut("clients")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| PanelError::InvalidResponse("clients missing from settings".to_string()))?;

    let client = clients
        .iter_mut()
        .filter_map(Value::as_object_mut)
        .find(|client| {
            client
                .get("email")
                .and_then(Value::as_str)
                .map(|email| identity.matches_email(canonical_email(email)))
                .unwrap_or(false)
        })
        .ok_or_else(|| PanelError::NotFound(identity.clone()))?;

    patch(client);

    settings.insert("decryption".to_string(), Value::String("none".to_string()));

    let encoded = serde_json::to_string(&Value::Object(settings))
        .map_err(|e| PanelError::InvalidResponse(format!("encoding settings: {}", e)))?;
    inbound["settings"] = Value::String(encoded);
    Ok(())
}
