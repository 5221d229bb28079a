//! Prometheus metrics for the tailing pipeline.
//!
//! All metrics use the default Prometheus registry:
//! - Counters: *_total
//! - Gauges: current values

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter,
    IntCounterVec, IntGauge,
};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

lazy_static! {
    // ==================== THROUGHPUT ====================
    pub static ref LINES_READ_TOTAL: IntCounter = register_int_counter!(
        "xmllog_agent_lines_read_total",
        "Complete lines read from tailed log files"
    )
    .unwrap();
    pub static ref RECORDS_PARSED_TOTAL: IntCounter = register_int_counter!(
        "xmllog_agent_records_parsed_total",
        "Record fragments that deserialized successfully"
    )
    .unwrap();
    pub static ref RECORDS_FORWARDED_TOTAL: IntCounter = register_int_counter!(
        "xmllog_agent_records_forwarded_total",
        "Records handed to the consumer"
    )
    .unwrap();
    pub static ref FILES_OPENED_TOTAL: IntCounter = register_int_counter!(
        "xmllog_agent_files_opened_total",
        "Log files opened for tailing"
    )
    .unwrap();

    // ==================== DROPS ====================
    pub static ref RECORDS_DROPPED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "xmllog_agent_records_dropped_total",
        "Completed records not forwarded, by reason",
        &["reason"]
    )
    .unwrap();
    pub static ref FILES_SKIPPED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "xmllog_agent_files_skipped_total",
        "Queued paths rejected by the tailer, by reason",
        &["reason"]
    )
    .unwrap();

    // ==================== GAUGES ====================
    pub static ref BACKLOG_FILES: IntGauge = register_int_gauge!(
        "xmllog_agent_backlog_files",
        "Files waiting in the pending queue"
    )
    .unwrap();
    pub static ref LAST_ENTRY_MILLIS: IntGauge = register_int_gauge!(
        "xmllog_agent_last_entry_millis",
        "Timestamp of the most recently parsed record"
    )
    .unwrap();
}

/// Serves `GET /metrics` on `addr` until `cancel_token` fires.
pub async fn serve(addr: SocketAddr, cancel_token: CancellationToken) -> Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use prometheus::Encoder;
    use tokio::net::TcpListener;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics server to {addr}"))?;

    info!(%addr, "metrics server listening on /metrics");

    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                info!("metrics server shutting down");
                return Ok(());
            }
            accept_result = listener.accept() => {
                let (stream, _) = match accept_result {
                    Ok(conn) => conn,
                    Err(err) => {
                        warn!(error = %err, "failed to accept metrics connection");
                        continue;
                    }
                };

                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(|req: Request<hyper::body::Incoming>| async move {
                        if req.uri().path() == "/metrics" {
                            let encoder = prometheus::TextEncoder::new();
                            let mut buffer = Vec::new();
                            match encoder.encode(&prometheus::gather(), &mut buffer) {
                                Ok(()) => Response::builder()
                                    .header(hyper::header::CONTENT_TYPE, encoder.format_type())
                                    .body(Full::new(Bytes::from(buffer))),
                                Err(err) => Response::builder()
                                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                                    .body(Full::new(Bytes::from(err.to_string()))),
                            }
                        } else {
                            Response::builder()
                                .status(StatusCode::NOT_FOUND)
                                .body(Full::new(Bytes::from("Not Found")))
                        }
                    });

                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        debug!(error = %err, "error serving metrics connection");
                    }
                });
            }
        }
    }
}
