//! WS-Man protocol client for pre-Redfish controllers: SOAP Identify for
//! probing and `InstallFromURI` for firmware submission.

use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use uuid::Uuid;

use crate::cfg::HttpConfig;
use crate::errors::{AnvilError, AnvilResult};
use crate::model::{
    ControllerGeneration, Credentials, FirmwareUpdateRequest, FirmwareUpdateResult, HealthStatus,
    Protocol, ProtocolCapability, ProtocolHealth, ServerIdentity, UpdateMode, UpdateStatus,
};
use crate::protocol::ProtocolClient;

const WSMAN_PORT: u16 = 443;
const SOAP_CONTENT_TYPE: &str = "application/soap+xml;charset=UTF-8";

const INSTALL_SERVICE_URI: &str =
    "http://schemas.dell.com/wbem/wscim/1/cim-schema/2/DCIM_SoftwareInstallationService";

pub struct WsmanClient {
    http: reqwest::Client,
    probe_timeout: Duration,
    request_timeout: Duration,
}

impl WsmanClient {
    pub fn new(config: &HttpConfig) -> AnvilResult<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .use_rustls_tls()
            .build()
            .map_err(|e| AnvilError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            probe_timeout: config.probe_timeout(),
            request_timeout: config.request_timeout(),
        })
    }

    fn endpoint_url(identity: &ServerIdentity, credentials: &Credentials) -> String {
        let port = credentials.port.unwrap_or(WSMAN_PORT);
        format!("https://{}:{}/wsman", identity.host, port)
    }

    async fn post_soap(
        &self,
        url: &str,
        credentials: &Credentials,
        envelope: String,
        timeout: Duration,
    ) -> AnvilResult<String> {
        let response = self
            .http
            .post(url)
            .basic_auth(&credentials.username, Some(&credentials.password))
            .header(reqwest::header::CONTENT_TYPE, SOAP_CONTENT_TYPE)
            .timeout(timeout)
            .body(envelope)
            .send()
            .await
            .map_err(|e| AnvilError::from_reqwest(url, e))?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            let mut body = body;
            body.truncate(512);
            return Err(AnvilError::Http {
                status: status.as_u16(),
                url: url.to_string(),
                body,
            });
        }
        Ok(body)
    }

    /// WS-Man Identify: the cheapest authenticated request the protocol
    /// defines, answered by any conforming listener.
    async fn identify(
        &self,
        identity: &ServerIdentity,
        credentials: &Credentials,
    ) -> AnvilResult<String> {
        let url = Self::endpoint_url(identity, credentials);
        let body = self
            .post_soap(&url, credentials, identify_envelope(), self.probe_timeout)
            .await?;
        if !body.contains("IdentifyResponse") {
            return Err(AnvilError::MalformedResponse {
                url,
                details: "no IdentifyResponse element in reply".to_string(),
            });
        }
        Ok(body)
    }
}

fn identify_envelope() -> String {
    concat!(
        r#"<?xml version="1.0" encoding="UTF-8"?>"#,
        r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" "#,
        r#"xmlns:wsmid="http://schemas.dmtf.org/wbem/wsman/identity/1/wsmanidentity.xsd">"#,
        "<s:Header/><s:Body><wsmid:Identify/></s:Body></s:Envelope>"
    )
    .to_string()
}

/// WS-Management Invoke envelope for `InstallFromURI` against the
/// software installation service.
fn install_envelope(endpoint: &str, image_uri: &str) -> String {
    let message_id = Uuid::new_v4();
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" "#,
            r#"xmlns:wsa="http://schemas.xmlsoap.org/ws/2004/08/addressing" "#,
            r#"xmlns:wsman="http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd" "#,
            r#"xmlns:p="{service}">"#,
            "<s:Header>",
            "<wsa:Action s:mustUnderstand=\"true\">{service}/InstallFromURI</wsa:Action>",
            "<wsa:To s:mustUnderstand=\"true\">{endpoint}</wsa:To>",
            "<wsman:ResourceURI s:mustUnderstand=\"true\">{service}</wsman:ResourceURI>",
            "<wsa:MessageID s:mustUnderstand=\"true\">uuid:{message_id}</wsa:MessageID>",
            "<wsa:ReplyTo><wsa:Address>",
            "http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous",
            "</wsa:Address></wsa:ReplyTo>",
            "<wsman:SelectorSet>",
            r#"<wsman:Selector Name="CreationClassName">DCIM_SoftwareInstallationService</wsman:Selector>"#,
            r#"<wsman:Selector Name="Name">SoftwareUpdate</wsman:Selector>"#,
            r#"<wsman:Selector Name="SystemCreationClassName">DCIM_ComputerSystem</wsman:Selector>"#,
            r#"<wsman:Selector Name="SystemName">IDRAC:ID</wsman:Selector>"#,
            "</wsman:SelectorSet>",
            "</s:Header>",
            "<s:Body><p:InstallFromURI_INPUT><p:URI>{image_uri}</p:URI></p:InstallFromURI_INPUT></s:Body>",
            "</s:Envelope>"
        ),
        service = INSTALL_SERVICE_URI,
        endpoint = endpoint,
        message_id = message_id,
        image_uri = xml_escape(image_uri),
    )
}

fn xml_escape(raw: &str) -> String {
    raw.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

static JOB_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"JID_[0-9A-Za-z_]+").expect("static regex"));
static PRODUCT_VENDOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"ProductVendor>([^<]+)<").expect("static regex"));

/// Controllers answer a submitted install with a job id of the form
/// `JID_<digits>` buried in the response envelope.
fn extract_job_id(body: &str) -> Option<String> {
    JOB_ID.find(body).map(|m| m.as_str().to_string())
}

fn extract_vendor(body: &str) -> Option<String> {
    PRODUCT_VENDOR
        .captures(body)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

#[async_trait]
impl ProtocolClient for WsmanClient {
    fn protocol(&self) -> Protocol {
        Protocol::Wsman
    }

    async fn detect_capability(
        &self,
        identity: &ServerIdentity,
        credentials: &Credentials,
    ) -> ProtocolCapability {
        match self.identify(identity, credentials).await {
            Ok(body) => ProtocolCapability::supported(
                Protocol::Wsman,
                vec![UpdateMode::Immediate],
                ControllerGeneration::LegacyWsman,
                extract_vendor(&body),
            ),
            Err(error) => {
                tracing::debug!(host = %identity, %error, "WS-Man probe failed");
                ProtocolCapability::unsupported(Protocol::Wsman, Some(error.to_string()))
            }
        }
    }

    async fn health_check(
        &self,
        identity: &ServerIdentity,
        credentials: &Credentials,
    ) -> ProtocolHealth {
        let started = Instant::now();
        let outcome = self.identify(identity, credentials).await;
        let latency = started.elapsed();
        let (status, error) = match outcome {
            Ok(_) => (HealthStatus::Healthy, None),
            Err(error @ AnvilError::Network { .. }) => {
                (HealthStatus::Unreachable, Some(error.to_string()))
            }
            Err(error) => (HealthStatus::Degraded, Some(error.to_string())),
        };
        ProtocolHealth {
            protocol: Protocol::Wsman,
            status,
            checked_at: Utc::now(),
            latency: Some(latency),
            error,
        }
    }

    async fn perform_firmware_update(
        &self,
        request: &FirmwareUpdateRequest,
    ) -> AnvilResult<FirmwareUpdateResult> {
        let component = request.components.first().ok_or_else(|| {
            AnvilError::Config("a WS-Man update needs at least one component image".to_string())
        })?;
        let url = Self::endpoint_url(&request.identity, &request.credentials);
        let envelope = install_envelope(&url, &component.image_uri);

        let started_at = Utc::now();
        tracing::info!(host = %request.identity, image = %component.image_uri,
            "Submitting WS-Man InstallFromURI");
        let body = self
            .post_soap(&url, &request.credentials, envelope, self.request_timeout)
            .await?;

        let job_id = extract_job_id(&body).ok_or_else(|| AnvilError::MalformedResponse {
            url,
            details: "InstallFromURI accepted but no JID_ job id in reply".to_string(),
        })?;

        let mut metadata = HashMap::new();
        metadata.insert("job_id".to_string(), serde_json::json!(job_id));
        Ok(FirmwareUpdateResult {
            protocol: Protocol::Wsman,
            status: UpdateStatus::Completed,
            started_at,
            completed_at: Utc::now(),
            messages: vec![format!("install job {job_id} created")],
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_url_defaults_to_443() {
        let identity = ServerIdentity::new("10.9.8.7");
        let mut creds = Credentials {
            username: "root".into(),
            password: "calvin".into(),
            port: None,
        };
        assert_eq!(
            WsmanClient::endpoint_url(&identity, &creds),
            "https://10.9.8.7:443/wsman"
        );
        creds.port = Some(5986);
        assert_eq!(
            WsmanClient::endpoint_url(&identity, &creds),
            "https://10.9.8.7:5986/wsman"
        );
    }

    #[test]
    fn job_id_is_extracted_from_the_response_envelope() {
        let body = r#"<s:Envelope><s:Body><n1:InstallFromURI_OUTPUT>
            <n1:Job><wsa:EndpointReference><wsman:SelectorSet>
            <wsman:Selector Name="InstanceID">JID_123456789012</wsman:Selector>
            </wsman:SelectorSet></wsa:EndpointReference></n1:Job>
            <n1:ReturnValue>4096</n1:ReturnValue>
            </n1:InstallFromURI_OUTPUT></s:Body></s:Envelope>"#;
        assert_eq!(extract_job_id(body).as_deref(), Some("JID_123456789012"));
        assert!(extract_job_id("<s:Envelope/>").is_none());
    }

    #[test]
    fn vendor_is_extracted_from_identify() {
        let body = r#"<wsmid:IdentifyResponse>
            <wsmid:ProductVendor>Dell EMC</wsmid:ProductVendor>
            <wsmid:ProductVersion>iDRAC</wsmid:ProductVersion>
            </wsmid:IdentifyResponse>"#;
        assert_eq!(extract_vendor(body).as_deref(), Some("Dell EMC"));
    }

    #[test]
    fn install_envelope_escapes_the_image_uri() {
        let envelope = install_envelope(
            "https://10.0.0.1:443/wsman",
            "http://repo/fw.exe?a=1&b=2",
        );
        assert!(envelope.contains("a=1&amp;b=2"));
        assert!(envelope.contains("InstallFromURI"));
    }
}
