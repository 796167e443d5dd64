//! Control-plane boundary and its HTTP implementation

use super::protocol::{
    CommandList, CommandReport, DeliveryAck, InboundCommand, RegistrationGrant, RegistrationRequest,
    RotationRequest, TelemetryBatch,
};
use super::{CommsError, Session};
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

const API_PREFIX: &str = "api/v1/agent";
const DEVICE_HEADER: &str = "X-Device-Id";

/// Everything the agent asks of the control plane
#[async_trait]
pub trait ControlPlane: Send + Sync + 'static {
    /// Exchange a registration token for a device id and session key
    async fn register(&self, request: &RegistrationRequest) -> Result<RegistrationGrant, CommsError>;

    async fn deliver(&self, session: &Session, batch: &TelemetryBatch) -> Result<DeliveryAck, CommsError>;

    async fn poll_commands(&self, session: &Session) -> Result<Vec<InboundCommand>, CommsError>;

    async fn report_command(&self, session: &Session, report: &CommandReport) -> Result<(), CommsError>;

    /// Announce `new_key`, authenticated with the current key
    async fn confirm_rotation(&self, session: &Session, new_key: &str) -> Result<(), CommsError>;

    fn set_endpoint(&self, url: &str) -> Result<(), CommsError>;

    fn endpoint(&self) -> String;
}

/// Validate a control-plane base URL
pub fn check_endpoint(url: &str) -> Result<reqwest::Url, CommsError> {
    let parsed =
        reqwest::Url::parse(url).map_err(|e| CommsError::Validation(format!("invalid endpoint {}: {}", url, e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(CommsError::Validation(format!("unsupported scheme {}", other))),
    }
}

/// Map a non-success status to the error taxonomy
fn status_error(status: StatusCode, body: String) -> CommsError {
    let detail = if body.is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, body.chars().take(200).collect::<String>())
    };
    match status.as_u16() {
        401 | 403 => CommsError::AuthenticationRejected(detail),
        408 | 429 => CommsError::Transient(detail),
        s if s >= 500 => CommsError::Transient(detail),
        s => CommsError::Rejected { status: s, detail },
    }
}

fn send_error(e: reqwest::Error) -> CommsError {
    if e.is_decode() {
        CommsError::Protocol(e.to_string())
    } else {
        // Timeouts, refused connections, resets: all worth retrying
        CommsError::Transient(e.to_string())
    }
}

pub struct HttpControlPlane {
    client: reqwest::Client,
    base: RwLock<reqwest::Url>,
}

impl HttpControlPlane {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, CommsError> {
        let base = check_endpoint(endpoint)?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("node-agent/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CommsError::Protocol(format!("cannot build http client: {}", e)))?;
        Ok(Self {
            client,
            base: RwLock::new(base),
        })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}/{}",
            self.base.read().as_str().trim_end_matches('/'),
            API_PREFIX,
            path
        )
    }

    fn authed(&self, builder: RequestBuilder, session: &Session) -> RequestBuilder {
        builder
            .bearer_auth(&session.session_key)
            .header(DEVICE_HEADER, &session.device_id)
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, CommsError> {
        let response = builder.send().await.map_err(send_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, body))
    }

    /// JSON body, where an empty body reads as `T::default()`
    async fn json_or_default<T: DeserializeOwned + Default>(response: Response) -> Result<T, CommsError> {
        let bytes = response.bytes().await.map_err(send_error)?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(T::default());
        }
        serde_json::from_slice(&bytes).map_err(|e| CommsError::Protocol(format!("bad response body: {}", e)))
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn register(&self, request: &RegistrationRequest) -> Result<RegistrationGrant, CommsError> {
        let response = self.send(self.client.post(self.url("register")).json(request)).await?;
        response
            .json::<RegistrationGrant>()
            .await
            .map_err(|e| CommsError::Protocol(format!("bad registration response: {}", e)))
    }

    async fn deliver(&self, session: &Session, batch: &TelemetryBatch) -> Result<DeliveryAck, CommsError> {
        debug!("Delivering {} {} records", batch.records.len(), batch.category);
        let request = self.authed(self.client.post(self.url("telemetry")), session).json(batch);
        let response = self.send(request).await?;
        Self::json_or_default(response).await
    }

    async fn poll_commands(&self, session: &Session) -> Result<Vec<InboundCommand>, CommsError> {
        let request = self.authed(self.client.get(self.url("commands")), session);
        let response = self.send(request).await?;
        let list: CommandList = Self::json_or_default(response).await?;
        Ok(list.commands)
    }

    async fn report_command(&self, session: &Session, report: &CommandReport) -> Result<(), CommsError> {
        let path = format!("commands/{}/result", report.command_id);
        let request = self.authed(self.client.post(self.url(&path)), session).json(report);
        self.send(request).await.map(|_| ())
    }

    async fn confirm_rotation(&self, session: &Session, new_key: &str) -> Result<(), CommsError> {
        let body = RotationRequest {
            new_key: new_key.to_string(),
        };
        let request = self.authed(self.client.post(self.url("rotate-key")), session).json(&body);
        self.send(request).await.map(|_| ())
    }

    fn set_endpoint(&self, url: &str) -> Result<(), CommsError> {
        let parsed = check_endpoint(url)?;
        *self.base.write() = parsed;
        Ok(())
    }

    fn endpoint(&self) -> String {
        self.base.read().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comms::protocol::CommandStatus;
    use crate::records::Category;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn session() -> Session {
        Session {
            device_id: "dev-1".to_string(),
            session_key: "key-1".to_string(),
            key_generation: 1,
        }
    }

    fn plane(server: &MockServer) -> HttpControlPlane {
        HttpControlPlane::new(&server.uri(), Duration::from_secs(2)).unwrap()
    }

    fn registration() -> RegistrationRequest {
        RegistrationRequest {
            device_id: None,
            registration_token: "tok".to_string(),
            system_info: json!({"hostname": "h"}),
            agent_version: "1.0.0".to_string(),
            timestamp: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_register_returns_grant() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/agent/register"))
            .and(body_partial_json(json!({"registration_token": "tok"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "device_id": "dev-9",
                "session_key": "s3cret"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let grant = plane(&server).register(&registration()).await.unwrap();
        assert_eq!(grant.device_id, "dev-9");
        assert_eq!(grant.endpoint, None);
    }

    #[tokio::test]
    async fn test_status_codes_map_to_error_classes() {
        let server = MockServer::start().await;
        Mock::given(path("/api/v1/agent/commands"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(path("/api/v1/agent/telemetry"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(path("/api/v1/agent/register"))
            .respond_with(ResponseTemplate::new(410).set_body_string("token expired"))
            .mount(&server)
            .await;

        let plane = plane(&server);
        assert!(matches!(
            plane.poll_commands(&session()).await,
            Err(CommsError::AuthenticationRejected(_))
        ));

        let batch = TelemetryBatch {
            device_id: "dev-1".to_string(),
            category: Category::Metrics,
            records: vec![],
        };
        assert!(matches!(plane.deliver(&session(), &batch).await, Err(CommsError::Transient(_))));

        match plane.register(&registration()).await {
            Err(CommsError::Rejected { status, detail }) => {
                assert_eq!(status, 410);
                assert!(detail.contains("token expired"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_authenticated_calls_carry_session() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/agent/commands"))
            .and(header("authorization", "Bearer key-1"))
            .and(header("x-device-id", "dev-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "commands": [{"command_id": "c1", "action": "agent.status"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/agent/commands/c1/result"))
            .and(body_partial_json(json!({"status": "accepted"})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let plane = plane(&server);
        let commands = plane.poll_commands(&session()).await.unwrap();
        assert_eq!(commands.len(), 1);

        let report = CommandReport {
            command_id: "c1".to_string(),
            status: CommandStatus::Accepted,
            detail: None,
            result: None,
        };
        plane.report_command(&session(), &report).await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_ack_accepts_whole_batch() {
        let server = MockServer::start().await;
        Mock::given(path("/api/v1/agent/telemetry"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;

        let batch = TelemetryBatch {
            device_id: "dev-1".to_string(),
            category: Category::Logs,
            records: vec![],
        };
        let ack = plane(&server).deliver(&session(), &batch).await.unwrap();
        assert_eq!(ack.accepted, None);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transient() {
        // Nothing listens on the discard port
        let plane = HttpControlPlane::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        assert!(matches!(plane.poll_commands(&session()).await, Err(CommsError::Transient(_))));
    }

    #[test]
    fn test_endpoint_validation() {
        let plane = HttpControlPlane::new("http://localhost:8000", Duration::from_secs(1)).unwrap();
        assert!(plane.set_endpoint("ftp://example.com").is_err());
        assert!(plane.set_endpoint("not a url").is_err());
        plane.set_endpoint("https://cp.example.com/").unwrap();
        assert_eq!(plane.url("register"), "https://cp.example.com/api/v1/agent/register");
    }
}
