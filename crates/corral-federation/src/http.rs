use crate::protocol::{
    Arguments, CallRequest, CapabilityDescriptor, Envelope, Handshake, PeerClient, PeerConnector,
    PROTOCOL_VERSION,
};
use crate::FederationError;
use corral_discovery::PeerRecord;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const PROTOCOL_HEADER: &str = "X-Corral-Protocol";

/// Peer client for the JSON surface:
/// - `GET  <endpoint>/handshake`
/// - `GET  <endpoint>/capabilities`
/// - `POST <endpoint>/call`
///
/// Handshake and listing are bounded by `timeout`. Calls use it only for
/// connecting; the whole call is bounded by `call_timeout`, or not at all.
pub struct HttpPeer {
    instance: String,
    base_url: String,
    agent: ureq::Agent,
    call_agent: ureq::Agent,
    connected: AtomicBool,
}

impl HttpPeer {
    pub fn new(record: &PeerRecord, timeout: Duration) -> Self {
        Self::with_call_timeout(record, timeout, None)
    }

    pub fn with_call_timeout(
        record: &PeerRecord,
        timeout: Duration,
        call_timeout: Option<Duration>,
    ) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build();
        let call_config = ureq::Agent::config_builder()
            .timeout_connect(Some(timeout))
            .timeout_global(call_timeout)
            .build();
        Self {
            instance: record.instance.clone(),
            base_url: record.url().trim_end_matches('/').to_owned(),
            agent: ureq::Agent::new_with_config(config),
            call_agent: ureq::Agent::new_with_config(call_config),
            connected: AtomicBool::new(true),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn ensure_connected(&self) -> Result<(), FederationError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(FederationError::Disconnected(self.instance.clone()))
        }
    }

    fn do_get(&self, path: &str) -> Result<Vec<u8>, FederationError> {
        self.ensure_connected()?;
        let url = format!("{}/{path}", self.base_url);
        tracing::debug!("GET {url}");
        let resp = self
            .agent
            .get(&url)
            .header(PROTOCOL_HEADER, &PROTOCOL_VERSION.to_string())
            .call()
            .map_err(|e| transport_error(&url, e))?;
        read_body(resp)
    }

    fn do_post(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, FederationError> {
        self.ensure_connected()?;
        let url = format!("{}/{path}", self.base_url);
        tracing::debug!("POST {url} ({} bytes)", body.len());
        let resp = self
            .call_agent
            .post(&url)
            .header("Content-Type", "application/json")
            .header(PROTOCOL_HEADER, &PROTOCOL_VERSION.to_string())
            .send(body)
            .map_err(|e| transport_error(&url, e))?;
        read_body(resp)
    }
}

fn transport_error(url: &str, e: ureq::Error) -> FederationError {
    match e {
        ureq::Error::StatusCode(code) => FederationError::Transport(format!("HTTP {code} for {url}")),
        e => FederationError::Transport(format!("{url}: {e}")),
    }
}

fn read_body(resp: ureq::http::Response<ureq::Body>) -> Result<Vec<u8>, FederationError> {
    let mut reader = resp.into_body().into_reader();
    let mut body = Vec::new();
    reader
        .read_to_end(&mut body)
        .map_err(|e| FederationError::Transport(e.to_string()))?;
    Ok(body)
}

impl PeerClient for HttpPeer {
    fn handshake(&self) -> Result<Handshake, FederationError> {
        let hs: Handshake = serde_json::from_slice(&self.do_get("handshake")?)?;
        if hs.protocol != PROTOCOL_VERSION {
            return Err(FederationError::Protocol(format!(
                "peer '{}' speaks protocol {}, expected {PROTOCOL_VERSION}",
                self.instance, hs.protocol
            )));
        }
        Ok(hs)
    }

    fn list_capabilities(&self) -> Result<Vec<CapabilityDescriptor>, FederationError> {
        Ok(serde_json::from_slice(&self.do_get("capabilities")?)?)
    }

    fn call(&self, name: &str, arguments: &Arguments) -> Result<Envelope, FederationError> {
        let req = CallRequest {
            name: name.to_owned(),
            arguments: arguments.clone(),
        };
        let body = serde_json::to_vec(&req)?;
        Ok(serde_json::from_slice(&self.do_post("call", &body)?)?)
    }

    fn close(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            tracing::debug!("closed connection to peer '{}'", self.instance);
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Connects to peers over HTTP. See [`HttpPeer`] for how the two timeouts
/// apply.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    timeout: Duration,
    call_timeout: Option<Duration>,
}

impl HttpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            call_timeout: None,
        }
    }

    #[must_use]
    pub fn with_call_timeout(mut self, call_timeout: Option<Duration>) -> Self {
        self.call_timeout = call_timeout;
        self
    }
}

impl Default for HttpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl PeerConnector for HttpConnector {
    fn connect(&self, record: &PeerRecord) -> Result<Arc<dyn PeerClient>, FederationError> {
        Ok(Arc::new(HttpPeer::with_call_timeout(
            record,
            self.timeout,
            self.call_timeout,
        )))
    }
}
