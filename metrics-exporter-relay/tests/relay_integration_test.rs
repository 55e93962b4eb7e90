use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use http_body_util::{BodyExt, Collected, Empty};
use hyper::{
    body::{Buf, Bytes},
    header::CONTENT_TYPE,
    Request, StatusCode, Uri,
};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use metrics_exporter_relay::proto::{Metric, PublishRequest, PublishResponse};
use metrics_exporter_relay::RelayBuilder;
use prost::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[test]
fn test_publish_then_scrape() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|e| panic!("Failed to create test runtime: {:?}", e));

    runtime.block_on(async {
        let local = [127, 0, 0, 1];
        let ingest_address = SocketAddr::from((local, get_available_port(local).await));
        let http_address = SocketAddr::from((local, get_available_port(local).await));

        let (_registry, exporter) = RelayBuilder::new()
            .with_ingest_listener(ingest_address)
            .with_http_listener(http_address)
            .static_label_str("host:node-1")
            .unwrap_or_else(|e| panic!("invalid static label: {:?}", e))
            .build()
            .unwrap_or_else(|e| panic!("failed to create relay: {:?}", e));

        spawn_relay(exporter);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let mut stream = TcpStream::connect(ingest_address)
            .await
            .unwrap_or_else(|e| panic!("failed to connect to ingestion endpoint: {:?}", e));

        let first = PublishRequest {
            metrics: vec![
                Metric::counter("volume_reads", &[("volume", "vol1")], 3),
                Metric::gauge("array_temperature", &[("array", "0")], 41),
                Metric::histogram(
                    "io_latency",
                    &[("prop1", "a")],
                    vec![0, 10, 20, 30, 40],
                    vec![0, 1, 2, 3, 4],
                    100.0,
                    4,
                ),
            ],
        };
        assert_eq!(publish(&mut stream, &first).await.total_received_metrics, 3);

        // A second request on the same connection, including one metric that is dropped.
        let mut unknown = Metric::gauge("ignored", &[], 1);
        unknown.r#type = 9;
        let second = PublishRequest {
            metrics: vec![Metric::counter("volume_reads", &[("volume", "vol1")], 4), unknown],
        };
        assert_eq!(publish(&mut stream, &second).await.total_received_metrics, 2);

        let uri = format!("http://{http_address}/metrics")
            .parse::<Uri>()
            .unwrap_or_else(|e| panic!("Error parsing URI: {:?}", e));
        let (status, body, content_type) = read_from(uri).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type, "text/plain; version=0.0.4");

        let body = String::from_utf8(body).expect("utf-8 body");
        assert!(body.contains("# TYPE volume_reads counter\n"));
        assert!(body.contains("volume_reads{host=\"node-1\",volume=\"vol1\"} 7\n"));
        assert!(body.contains("array_temperature{array=\"0\",host=\"node-1\"} 41\n"));
        assert!(body.contains("io_latency_bucket{host=\"node-1\",prop1=\"a\",le=\"30\"} 3\n"));
        assert!(body.contains("io_latency_bucket{host=\"node-1\",prop1=\"a\",le=\"+Inf\"} 4\n"));
        assert!(body.contains("io_latency_sum{host=\"node-1\",prop1=\"a\"} 100\n"));
        assert!(body.contains("io_latency_count{host=\"node-1\",prop1=\"a\"} 4\n"));
        assert!(!body.contains("ignored"));

        let uri = format!("http://{http_address}/health")
            .parse::<Uri>()
            .unwrap_or_else(|e| panic!("Error parsing URI: {:?}", e));
        let (status, body, _) = read_from(uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"OK");

        let uri = format!("http://{http_address}/nope")
            .parse::<Uri>()
            .unwrap_or_else(|e| panic!("Error parsing URI: {:?}", e));
        let (status, _, _) = read_from(uri).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    });
}

#[test]
fn test_malformed_frame_closes_connection() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|e| panic!("Failed to create test runtime: {:?}", e));

    runtime.block_on(async {
        let local = [127, 0, 0, 1];
        let ingest_address = SocketAddr::from((local, get_available_port(local).await));
        let http_address = SocketAddr::from((local, get_available_port(local).await));

        let (registry, exporter) = RelayBuilder::new()
            .with_ingest_listener(ingest_address)
            .with_http_listener(http_address)
            .build()
            .unwrap_or_else(|e| panic!("failed to create relay: {:?}", e));

        spawn_relay(exporter);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let mut stream = TcpStream::connect(ingest_address)
            .await
            .unwrap_or_else(|e| panic!("failed to connect to ingestion endpoint: {:?}", e));
        stream.write_all(&[0x02, 0x0a, 0xff]).await.expect("write garbage");

        let mut buf = Vec::new();
        // Either a clean close or a reset is fine; no response may be sent.
        let _ = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut buf))
            .await
            .expect("connection closed in time");
        assert!(buf.is_empty());

        // The listener keeps serving other connections.
        let mut stream = TcpStream::connect(ingest_address)
            .await
            .unwrap_or_else(|e| panic!("failed to connect to ingestion endpoint: {:?}", e));
        let request = PublishRequest { metrics: vec![Metric::gauge("temp", &[], 12)] };
        assert_eq!(publish(&mut stream, &request).await.total_received_metrics, 1);
        assert!(registry.render().contains("temp 12\n"));
    });
}

#[test]
fn test_install_runs_on_dedicated_thread() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|e| panic!("Failed to create test runtime: {:?}", e));

    let local = [127, 0, 0, 1];
    let ingest_address = SocketAddr::from((local, runtime.block_on(get_available_port(local))));
    let http_address = SocketAddr::from((local, runtime.block_on(get_available_port(local))));

    // Called outside of any runtime, so the relay gets its own thread.
    let registry = RelayBuilder::new()
        .with_ingest_listener(ingest_address)
        .with_http_listener(http_address)
        .install()
        .unwrap_or_else(|e| panic!("failed to install relay: {:?}", e));

    runtime.block_on(async {
        let mut stream = TcpStream::connect(ingest_address)
            .await
            .unwrap_or_else(|e| panic!("failed to connect to ingestion endpoint: {:?}", e));
        let request = PublishRequest { metrics: vec![Metric::counter("writes", &[], 2)] };
        assert_eq!(publish(&mut stream, &request).await.total_received_metrics, 1);

        let uri = format!("http://{http_address}/metrics")
            .parse::<Uri>()
            .unwrap_or_else(|e| panic!("Error parsing URI: {:?}", e));
        let (status, body, _) = read_from(uri).await;
        assert_eq!(status, StatusCode::OK);
        assert!(String::from_utf8(body).expect("utf-8 body").contains("writes 2\n"));
    });

    assert!(registry.render().contains("writes 2\n"));
}

fn spawn_relay(exporter: metrics_exporter_relay::ExporterFuture) {
    tokio::spawn(async move {
        if let Err(e) = exporter.await {
            panic!("relay stopped: {:?}", e);
        }
    });
}

async fn publish(stream: &mut TcpStream, request: &PublishRequest) -> PublishResponse {
    stream
        .write_all(&request.encode_length_delimited_to_vec())
        .await
        .unwrap_or_else(|e| panic!("failed to send request: {:?}", e));

    let mut buf = BytesMut::new();
    loop {
        let read = stream
            .read_buf(&mut buf)
            .await
            .unwrap_or_else(|e| panic!("failed to read response: {:?}", e));
        assert!(read > 0, "connection closed before a response arrived");

        if let Ok(len) = prost::decode_length_delimiter(&buf[..]) {
            if buf.len() >= prost::length_delimiter_len(len) + len {
                return PublishResponse::decode_length_delimited(&buf[..])
                    .unwrap_or_else(|e| panic!("failed to decode response: {:?}", e));
            }
        }
    }
}

async fn get_available_port(listen_address: [u8; 4]) -> u16 {
    let socket_address = SocketAddr::from((listen_address, 0));
    TcpListener::bind(socket_address)
        .await
        .unwrap_or_else(|e| {
            panic!("Unable to bind to an available port on address {socket_address}: {:?}", e);
        })
        .local_addr()
        .expect("Unable to obtain local address from TcpListener")
        .port()
}

async fn read_from(endpoint: Uri) -> (StatusCode, Vec<u8>, String) {
    let client = Client::builder(hyper_util::rt::TokioExecutor::new()).build(HttpConnector::new());

    let req = Request::builder()
        .uri(endpoint.to_string())
        .body(Empty::<Bytes>::new())
        .unwrap_or_else(|e| panic!("Failed building request: {:?}", e));

    let response = client
        .request(req)
        .await
        .unwrap_or_else(|e| panic!("Failed requesting data from {endpoint}: {:?}", e));

    let status = response.status();
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let mut body = response
        .into_body()
        .collect()
        .await
        .map(Collected::aggregate)
        .unwrap_or_else(|e| panic!("Error reading response: {:?}", e));

    let body_bytes = body.copy_to_bytes(body.remaining()).to_vec();

    (status, body_bytes, content_type)
}
