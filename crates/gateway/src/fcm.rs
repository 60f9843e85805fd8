//! FCM HTTP v1 gateway.

use async_trait::async_trait;
use serde::Deserialize;

use crate::auth::{ServiceAccountAuth, ServiceAccountKey};
use crate::message::PushMessage;
use crate::{GatewayError, PushGateway};

/// Sends messages through `POST /v1/projects/{project}/messages:send`.
pub struct FcmGateway {
    http: reqwest::Client,
    auth: ServiceAccountAuth,
    send_url: String,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    /// `projects/{project}/messages/{id}`
    name: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
    status: Option<String>,
    #[serde(default)]
    details: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(rename = "errorCode")]
    error_code: Option<String>,
}

impl FcmGateway {
    /// Build a gateway for `project_id`, or the key's own project when `None`.
    pub fn new(
        key: ServiceAccountKey,
        project_id: Option<String>,
        base_url: &str,
    ) -> Result<Self, GatewayError> {
        let project_id = project_id
            .or_else(|| key.project_id.clone())
            .ok_or_else(|| {
                GatewayError::Unavailable(
                    "No FCM project id configured and none in the service account key".to_string(),
                )
            })?;

        let http = reqwest::Client::new();
        let auth = ServiceAccountAuth::new(key, http.clone())?;

        tracing::info!(
            project_id = %project_id,
            client_email = %auth.key().client_email,
            "FCM gateway configured"
        );

        Ok(Self {
            http,
            auth,
            send_url: send_url(base_url, &project_id),
        })
    }

    pub fn send_url(&self) -> &str {
        &self.send_url
    }
}

fn send_url(base_url: &str, project_id: &str) -> String {
    format!(
        "{}/v1/projects/{}/messages:send",
        base_url.trim_end_matches('/'),
        project_id
    )
}

/// Map an FCM error response to a [`GatewayError`].
fn rejection(status: u16, body: &str) -> GatewayError {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => {
            let code = envelope
                .error
                .details
                .iter()
                .find_map(|d| d.error_code.clone())
                .or(envelope.error.status);
            GatewayError::Rejected {
                status,
                code,
                message: envelope.error.message,
            }
        }
        Err(_) => GatewayError::Rejected {
            status,
            code: None,
            message: format!("FCM returned status {}: {}", status, body.trim()),
        },
    }
}

#[async_trait]
impl PushGateway for FcmGateway {
    async fn send(&self, message: &PushMessage) -> Result<String, GatewayError> {
        let token = self.auth.access_token().await?;

        let response = self
            .http
            .post(&self.send_url)
            .bearer_auth(token)
            .json(&message.to_send_request())
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(rejection(status.as_u16(), &body));
        }

        let sent: SendResponse = serde_json::from_str(&body)
            .map_err(|e| GatewayError::Parse(format!("Invalid send response: {}", e)))?;

        Ok(sent.name)
    }

    fn name(&self) -> &'static str {
        "fcm"
    }
}
