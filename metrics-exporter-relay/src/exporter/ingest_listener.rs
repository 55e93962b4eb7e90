use std::net::SocketAddr;

use bytes::BytesMut;
use prost::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, trace, warn};

use crate::{
    common::{BuildError, ExporterError, FrameError},
    ingest::Ingestor,
    proto::PublishRequest,
    ExporterFuture,
};

/// Largest request accepted on an ingestion connection.
pub(crate) const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Longest possible varint length prefix.
const MAX_DELIMITER_LEN: usize = 10;

struct IngestListeningExporter {
    ingestor: Ingestor,
}

impl IngestListeningExporter {
    async fn serve(&self, listener: std::net::TcpListener) -> Result<(), ExporterError> {
        let listener = TcpListener::from_std(listener).map_err(ExporterError::IngestListener)?;

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "error accepting ingestion connection");
                    continue;
                }
            };

            trace!(%peer, "accepted ingestion connection");

            let ingestor = self.ingestor.clone();
            tokio::task::spawn(async move {
                match drive_connection(&ingestor, stream).await {
                    Ok(()) => trace!(%peer, "ingestion connection closed"),
                    Err(e) => warn!(%peer, error = %e, "closing ingestion connection"),
                }
            });
        }
    }
}

/// Serves requests on one connection until the peer disconnects.
async fn drive_connection(ingestor: &Ingestor, mut stream: TcpStream) -> Result<(), FrameError> {
    let mut buf = BytesMut::with_capacity(8 * 1024);

    loop {
        while let Some(request) = next_request(&mut buf)? {
            let response = ingestor.publish(request);
            stream.write_all(&response.encode_length_delimited_to_vec()).await?;
        }

        if stream.read_buf(&mut buf).await? == 0 {
            return if buf.is_empty() { Ok(()) } else { Err(FrameError::Truncated(buf.len())) };
        }
    }
}

/// Splits the next complete request off the front of `buf`.
///
/// Returns `Ok(None)` if `buf` does not yet hold a complete frame.
fn next_request(buf: &mut BytesMut) -> Result<Option<PublishRequest>, FrameError> {
    let len = match prost::decode_length_delimiter(&buf[..]) {
        Ok(len) => len,
        // Fewer than ten bytes means the prefix may simply be incomplete.
        Err(_) if buf.len() < MAX_DELIMITER_LEN => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(len));
    }

    let needed = prost::length_delimiter_len(len) + len;
    if buf.len() < needed {
        buf.reserve(needed - buf.len());
        return Ok(None);
    }

    let frame = buf.split_to(needed);
    let request = PublishRequest::decode_length_delimited(&frame[..])?;
    Ok(Some(request))
}

/// Creates an `ExporterFuture` implementing a TCP listener that accepts length-delimited
/// [`PublishRequest`]s and applies them through `ingestor`.
///
/// # Errors
/// Will return Err if it cannot bind to the listen address
pub(crate) fn new_ingest_listener(
    ingestor: Ingestor,
    listen_address: SocketAddr,
) -> Result<ExporterFuture, BuildError> {
    let listener = std::net::TcpListener::bind(listen_address)
        .and_then(|listener| {
            listener.set_nonblocking(true)?;
            Ok(listener)
        })
        .map_err(|e| BuildError::FailedToCreateIngestListener(e.to_string()))?;

    debug!(%listen_address, "ingestion endpoint listening");

    let exporter = IngestListeningExporter { ingestor };

    Ok(Box::pin(async move { exporter.serve(listener).await }))
}
