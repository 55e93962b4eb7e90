use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use http_body_util::Full;
use hyper::{
    body::{Bytes, Incoming},
    header::{HeaderValue, CONTENT_TYPE},
    server::conn::http1::Builder as HyperHttpBuilder,
    service::service_fn,
    Method, Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use ipnet::IpNet;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::{
    common::{BuildError, ExporterError},
    registry::Registry,
    ExporterFuture,
};

/// Content type of the Prometheus text exposition format.
const TEXT_FORMAT_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

struct HttpListeningExporter {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Arc<Registry>,
    allowed_addresses: Option<Vec<IpNet>>,
}

impl HttpListeningExporter {
    async fn serve(&self, listener: std::net::TcpListener) -> Result<(), ExporterError> {
        let listener = TcpListener::from_std(listener).map_err(ExporterError::HttpListener)?;

        loop {
            let stream = match listener.accept().await {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!("Error accepting connection. Ignoring request. Error: {:?}", e);
                    continue;
                }
            };

            let remote_addr = match stream.peer_addr() {
                Ok(remote_address) => remote_address.ip(),
                Err(e) => {
                    warn!("Error obtaining remote address. Ignoring request. Error: {:?}", e);
                    continue;
                }
            };

            self.process_stream(stream, remote_addr);
        }
    }

    fn process_stream(&self, stream: TcpStream, remote_address: IpAddr) {
        let inner = self.inner.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let inner = inner.clone();
            async move {
                Ok::<_, hyper::Error>(Self::handle_http_request(&inner, remote_address, &req))
            }
        });

        tokio::task::spawn(async move {
            if let Err(err) =
                HyperHttpBuilder::new().serve_connection(TokioIo::new(stream), service).await
            {
                warn!("Error serving connection.  Error: {:?}", err);
            };
        });
    }

    fn handle_http_request<B>(
        inner: &Inner,
        remote_address: IpAddr,
        req: &Request<B>,
    ) -> Response<Full<Bytes>> {
        let is_allowed = match &inner.allowed_addresses {
            Some(addresses) => addresses.iter().any(|address| address.contains(&remote_address)),
            None => true,
        };

        if !is_allowed {
            debug!(%remote_address, "rejecting request from address outside the allowlist");
            return Self::new_response(StatusCode::FORBIDDEN, Full::default());
        }

        match (req.method(), req.uri().path()) {
            (&Method::GET, "/metrics") => {
                let mut response =
                    Self::new_response(StatusCode::OK, inner.registry.render().into());
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static(TEXT_FORMAT_CONTENT_TYPE));
                response
            }
            (&Method::GET, "/health") => Self::new_response(StatusCode::OK, "OK".into()),
            (_, "/metrics" | "/health") => {
                Self::new_response(StatusCode::METHOD_NOT_ALLOWED, Full::default())
            }
            _ => Self::new_response(StatusCode::NOT_FOUND, Full::default()),
        }
    }

    fn new_response(status: StatusCode, body: Full<Bytes>) -> Response<Full<Bytes>> {
        let mut response = Response::new(body);
        *response.status_mut() = status;
        response
    }
}

/// Creates an `ExporterFuture` implementing an HTTP listener that serves the registry in the
/// Prometheus text format.
///
/// # Errors
/// Will return Err if it cannot bind to the listen address
pub(crate) fn new_http_listener(
    registry: Arc<Registry>,
    listen_address: SocketAddr,
    allowed_addresses: Option<Vec<IpNet>>,
) -> Result<ExporterFuture, BuildError> {
    let listener = std::net::TcpListener::bind(listen_address)
        .and_then(|listener| {
            listener.set_nonblocking(true)?;
            Ok(listener)
        })
        .map_err(|e| BuildError::FailedToCreateHTTPListener(e.to_string()))?;

    debug!(%listen_address, "scrape endpoint listening");

    let exporter =
        HttpListeningExporter { inner: Arc::new(Inner { registry, allowed_addresses }) };

    Ok(Box::pin(async move { exporter.serve(listener).await }))
}
