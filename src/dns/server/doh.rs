//! DNS-over-HTTPS endpoint (RFC 8484)
//!
//! Serves `application/dns-message` on `/dns-query` over the TLS
//! listener, with HTTP/2 negotiated via ALPN and HTTP/1.1 as fallback.
//! `GET` carries the query in the base64url-encoded (unpadded) `dns`
//! parameter; `POST` carries it as the request body. The raw upstream
//! response (or the ServFail-patched query) is returned as the response
//! body with status 200; input errors map to 400 and unsupported
//! methods to 405.

use std::convert::Infallible;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{header, Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use super::DnsHandler;

/// The only served path.
pub const DOH_PATH: &str = "/dns-query";
/// DNS message media type.
pub const DOH_CONTENT_TYPE: &str = "application/dns-message";

pub(super) async fn serve_doh(
    handler: Arc<DnsHandler>,
    listener: TcpListener,
    acceptor: TlsAcceptor,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (conn, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "failed to accept connection");
                        continue;
                    }
                };

                let handler = Arc::clone(&handler);
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let tls_conn = match acceptor.accept(conn).await {
                        Ok(tls_conn) => tls_conn,
                        Err(e) => {
                            debug!(peer = %peer, error = %e, "TLS accept failed");
                            return;
                        }
                    };

                    let service = service_fn(move |req| {
                        let handler = Arc::clone(&handler);
                        async move {
                            debug!(peer = %peer, method = %req.method(), "handle DoH query");
                            Ok::<_, Infallible>(handle_request(handler, req).await)
                        }
                    });

                    let result = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(tls_conn), service)
                        .await;
                    if let Err(e) = result {
                        debug!(peer = %peer, error = %e, "DoH connection ended");
                    }
                });
            }
        }
    }

    info!("stopped DoH forwarder");
}

/// Handle one DoH request.
///
/// Extracted from the connection plumbing so the HTTP semantics are
/// testable without a TLS client.
pub async fn handle_request<B>(handler: Arc<DnsHandler>, req: Request<B>) -> Response<Full<Bytes>>
where
    B: hyper::body::Body,
    B::Error: std::fmt::Display,
{
    if req.uri().path() != DOH_PATH {
        return text_response(StatusCode::BAD_REQUEST, "400 bad request: uri invalid");
    }

    let query: Vec<u8> = if req.method() == Method::GET {
        let Some(value) = req.uri().query().and_then(dns_param) else {
            return text_response(StatusCode::BAD_REQUEST, "400 bad request: dns missing");
        };
        match URL_SAFE_NO_PAD.decode(value) {
            Ok(decoded) if !decoded.is_empty() => decoded,
            _ => {
                return text_response(StatusCode::BAD_REQUEST, "400 bad request: dns invalid");
            }
        }
    } else if req.method() == Method::POST {
        let content_type = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if content_type != DOH_CONTENT_TYPE {
            return text_response(
                StatusCode::BAD_REQUEST,
                "400 bad request: content-type invalid",
            );
        }
        match req.into_body().collect().await {
            Ok(collected) => {
                let body = collected.to_bytes();
                if body.is_empty() {
                    return text_response(StatusCode::BAD_REQUEST, "400 bad request: body");
                }
                body.to_vec()
            }
            Err(e) => {
                debug!(error = %e, "failed to read request body");
                return text_response(StatusCode::BAD_REQUEST, "400 bad request: body");
            }
        }
    } else {
        return text_response(StatusCode::METHOD_NOT_ALLOWED, "405 method not allowed");
    };

    match handler.handle_query(&query, false).await {
        Some(reply) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, DOH_CONTENT_TYPE)
            .body(Full::new(Bytes::from(reply)))
            .expect("static response parts are valid"),
        None => text_response(StatusCode::BAD_REQUEST, "400 bad request: query invalid"),
    }
}

/// The `dns` parameter of a query string; base64url needs no further
/// percent-decoding.
fn dns_param(query: &str) -> Option<&str> {
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("dns="))
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from_static(body.as_bytes())))
        .expect("static response parts are valid")
}
