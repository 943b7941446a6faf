//! Local HTTP control server
//!
//! Listens on localhost and accepts `POST /rpc` with a tagged JSON request
//! body, returning `{"success": true, ...}` or `{"success": false, "error"}`.

mod handlers;
mod requests;

pub use handlers::handle_request;
pub use requests::{ControlRequest, parse_request};

use anyhow::{Context, Result};
use std::thread;
use tiny_http::{Header, Response, Server};
use tracing::{error, info};

use crate::runner::Runner;

fn json_content_type() -> Header {
    Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
        .expect("static header is valid")
}

/// Start the control server in a background thread. Requests are executed on
/// the calling tokio runtime.
pub fn start_http_server(runner: Runner, port: u16) -> Result<()> {
    let rt = tokio::runtime::Handle::try_current()
        .context("The control server must start inside a tokio runtime")?;

    let server = Server::http(("127.0.0.1", port))
        .map_err(|e| anyhow::anyhow!("Failed to bind control server: {e}"))?;
    info!("[dagrun:http] Control server listening on http://127.0.0.1:{port}");

    thread::spawn(move || {
        for mut request in server.incoming_requests() {
            let mut body = String::new();
            if let Err(e) = request.as_reader().read_to_string(&mut body) {
                error!("[dagrun:http] Failed to read request body: {e}");
                continue;
            }

            let method = request.method().to_string();
            let url = request.url().to_string();
            let response_body = match (method.as_str(), url.as_str()) {
                ("POST", "/rpc") => dispatch(&runner, &rt, &body),
                _ => serde_json::json!({"success": false, "error": "not found"}),
            };

            let response = Response::from_string(response_body.to_string())
                .with_header(json_content_type());
            if let Err(e) = request.respond(response) {
                error!("[dagrun:http] Failed to respond: {e}");
            }
        }
    });

    Ok(())
}

fn dispatch(
    runner: &Runner,
    rt: &tokio::runtime::Handle,
    body: &str,
) -> serde_json::Value {
    let parsed: serde_json::Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(e) => {
            return serde_json::json!({"success": false, "error": format!("Invalid JSON: {e}")});
        }
    };

    match parse_request(&parsed) {
        Ok(request) => rt.block_on(handle_request(runner, request)),
        Err(e) => serde_json::json!({"success": false, "error": e}),
    }
}
