//! Demo upstream: answers every request with a JSON description of what it received.
//!
//! `/__status/{code}` answers with that status instead.

use anyhow::{Context, Result};
use http_body_util::Full;
use hyper::{
    body::{Bytes, Incoming},
    header::{HeaderValue, CONTENT_TYPE},
    server::conn::http1,
    service::service_fn,
    Request, Response, StatusCode,
};
use hyper_util::rt::tokio::TokioIo;
use serde_json::{json, Map, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info};
use tracing_subscriber::fmt::init as tracing_init;

const STATUS_PREFIX: &str = "/__status/";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_init();

    let port: u16 = match std::env::var("PORT") {
        Ok(port) => port.parse().with_context(|| format!("Invalid PORT {:?}", port))?,
        Err(_) => 3001,
    };
    let name: Arc<str> = std::env::var("SERVICE_NAME")
        .unwrap_or_else(|_| "echo".to_string())
        .into();

    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let listener = TcpListener::bind(addr).await?;
    info!("{} listening on {}", name, addr);

    loop {
        let (stream, peer) = listener.accept().await?;
        let name = name.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                let response = handle(&name, peer, req);
                async move { Ok::<_, Infallible>(response) }
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!("Error serving connection from {}: {}", peer, e);
            }
        });
    }
}

fn handle(name: &str, peer: SocketAddr, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let path = req.uri().path();
    if let Some(code) = path.strip_prefix(STATUS_PREFIX) {
        let status = code
            .parse::<u16>()
            .ok()
            .and_then(|c| StatusCode::from_u16(c).ok())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = json!({
            "service": name,
            "requested_code": status.as_u16(),
            "message": status.canonical_reason().unwrap_or(""),
        });
        return json_response(status, &body);
    }

    let mut headers = Map::new();
    for key in req.headers().keys() {
        let values: Vec<&str> = req
            .headers()
            .get_all(key)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        let value = match values.as_slice() {
            [single] => Value::from(*single),
            many => Value::from(many.to_vec()),
        };
        headers.insert(key.as_str().to_string(), value);
    }

    let body = json!({
        "service": name,
        "method": req.method().as_str(),
        "path": path,
        "query": req.uri().query().unwrap_or(""),
        "headers": headers,
        "remote_addr": peer.to_string(),
    });
    debug!("{} {} from {}", req.method(), path, peer);
    json_response(StatusCode::OK, &body)
}

fn json_response(status: StatusCode, body: &Value) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
