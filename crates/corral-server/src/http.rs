use crate::dispatch::Dispatcher;
use crate::ServerError;
use corral_federation::{CallRequest, Envelope, PROTOCOL_VERSION};
use serde::Serialize;
use std::io::{Cursor, Read};
use std::sync::Arc;
use std::thread::JoinHandle;
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};
use tracing::{debug, error, info, warn};

const PROTOCOL_HEADER: &str = "X-Corral-Protocol";

/// `mcp`, `/mcp/` and `/mcp` all become `/mcp`; empty becomes `/`.
pub fn normalize_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim().trim_matches('/');
    if trimmed.is_empty() {
        "/".to_owned()
    } else {
        format!("/{trimmed}")
    }
}

fn json_response(status: u16, body: Vec<u8>) -> Response<Cursor<Vec<u8>>> {
    let resp = Response::from_data(body).with_status_code(StatusCode(status));
    match Header::from_bytes("Content-Type", "application/json") {
        Ok(header) => resp.with_header(header),
        Err(()) => resp,
    }
}

fn respond_json(req: Request, status: u16, value: &impl Serialize) {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let _ = req.respond(json_response(status, body));
        }
        Err(e) => {
            error!("failed to serialize response: {e}");
            let _ = req.respond(Response::empty(500));
        }
    }
}

fn respond_err(req: Request, code: u16, msg: &str) {
    respond_json(req, code, &Envelope::err(msg));
}

fn read_body(req: &mut Request) -> Option<Vec<u8>> {
    let mut body = Vec::new();
    req.as_reader().read_to_end(&mut body).ok().map(|_| body)
}

fn protocol_mismatch(req: &Request) -> Option<String> {
    req.headers()
        .iter()
        .find(|h| h.field.equiv(PROTOCOL_HEADER))
        .map(|h| h.value.as_str().trim().to_owned())
        .filter(|v| *v != PROTOCOL_VERSION.to_string())
}

fn handle_call(dispatcher: &Dispatcher, mut req: Request) {
    let Some(body) = read_body(&mut req) else {
        respond_err(req, 400, "failed to read request body");
        return;
    };
    let call: CallRequest = match serde_json::from_slice(&body) {
        Ok(c) => c,
        Err(e) => {
            respond_err(req, 400, &format!("invalid call request: {e}"));
            return;
        }
    };
    let envelope = dispatcher.call(&call.name, &call.arguments);
    respond_json(req, 200, &envelope);
}

/// Route one request. Paths below `endpoint` carry the peer protocol;
/// `/health` is answered regardless of endpoint.
pub fn handle_request(dispatcher: &Dispatcher, endpoint: &str, req: Request) {
    let method = req.method().clone();
    let url = req.url().to_owned();
    let path = url.split('?').next().unwrap_or_default();
    debug!("{method} {path}");

    if path == "/health" {
        if method == Method::Get {
            let _ = req.respond(json_response(200, br#"{"status":"ok"}"#.to_vec()));
        } else {
            respond_err(req, 405, "method not allowed");
        }
        return;
    }

    let route = path
        .strip_prefix(endpoint.trim_end_matches('/'))
        .and_then(|rest| rest.strip_prefix('/'));
    let Some(route) = route else {
        respond_err(req, 404, "not found");
        return;
    };

    if let Some(version) = protocol_mismatch(&req) {
        warn!("rejecting {method} {path}: client protocol {version}");
        respond_err(
            req,
            400,
            &format!("unsupported protocol {version}, server speaks {PROTOCOL_VERSION}"),
        );
        return;
    }

    match (route, &method) {
        ("handshake", Method::Get) => respond_json(req, 200, &dispatcher.handshake()),
        ("capabilities", Method::Get) => respond_json(req, 200, &dispatcher.capabilities()),
        ("call", Method::Post) => handle_call(dispatcher, req),
        ("handshake" | "capabilities" | "call", _) => {
            respond_err(req, 405, "method not allowed");
        }
        _ => respond_err(req, 404, "not found"),
    }
}

/// A running pool of worker threads sharing one listener.
pub struct HttpServer {
    server: Arc<Server>,
    workers: Vec<JoinHandle<()>>,
    port: u16,
}

impl HttpServer {
    pub fn bind(
        addr: &str,
        endpoint: &str,
        workers: usize,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Self, ServerError> {
        let server = Server::http(addr).map_err(|e| ServerError::Http(format!("{addr}: {e}")))?;
        let port = server
            .server_addr()
            .to_ip()
            .map(|a| a.port())
            .ok_or_else(|| ServerError::Http(format!("{addr} is not an IP address")))?;
        let server = Arc::new(server);
        let endpoint = normalize_endpoint(endpoint);

        let workers = (0..workers.max(1))
            .map(|i| {
                let server = Arc::clone(&server);
                let dispatcher = Arc::clone(&dispatcher);
                let endpoint = endpoint.clone();
                std::thread::Builder::new()
                    .name(format!("corral-http-{i}"))
                    .spawn(move || {
                        for request in server.incoming_requests() {
                            handle_request(&dispatcher, &endpoint, request);
                        }
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            "serving {endpoint} on port {port} with {} workers",
            workers.len()
        );
        Ok(Self {
            server,
            workers,
            port,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop accepting requests and join every worker.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        for _ in 0..self.workers.len() {
            self.server.unblock();
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("HTTP worker panicked");
            }
        }
    }
}

impl Drop for HttpServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Starts the HTTP surface on `127.0.0.1:{random}` with endpoint `/mcp`.
/// Dropping it stops the workers.
pub struct TestServer {
    pub url: String,
    pub port: u16,
    pub dispatcher: Arc<Dispatcher>,
    _server: HttpServer,
}

impl TestServer {
    pub fn start(dispatcher: Arc<Dispatcher>) -> Result<Self, ServerError> {
        let server = HttpServer::bind("127.0.0.1:0", "/mcp", 2, Arc::clone(&dispatcher))?;
        let port = server.port();
        Ok(Self {
            url: format!("http://127.0.0.1:{port}"),
            port,
            dispatcher,
            _server: server,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_normalization() {
        assert_eq!(normalize_endpoint("/mcp"), "/mcp");
        assert_eq!(normalize_endpoint("mcp/"), "/mcp");
        assert_eq!(normalize_endpoint("/api/v1/"), "/api/v1");
        assert_eq!(normalize_endpoint(""), "/");
        assert_eq!(normalize_endpoint("/"), "/");
    }
}
