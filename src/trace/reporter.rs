use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;

use crate::api::reqauth::platform;
use crate::trace::eventbuf::signed_to_unsigned_i64;
use crate::trace::protocol::{TraceEvent, TRACE_VERSION};
use crate::trace::time_anchor::TimeAnchor;
use crate::trace::Tracer;

pub struct ReporterConfig {
    pub app_id: String,
    pub env_id: String,
    pub deploy_id: String,
    pub app_commit: String,
    pub trace_endpoint: reqwest::Url,
    pub platform_validator: Arc<platform::RequestValidator>,
}

/// Streams trace events to the trace collector.
#[must_use]
pub struct Reporter {
    rx: tokio::sync::mpsc::UnboundedReceiver<TraceEvent>,
    anchor: TimeAnchor,
    http_client: reqwest::Client,
    config: ReporterConfig,
}

pub fn streaming_tracer(
    http_client: reqwest::Client,
    config: ReporterConfig,
) -> (Tracer, Reporter) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let tracer = Tracer::new(tx);

    let reporter = Reporter {
        rx,
        anchor: TimeAnchor::new(),
        http_client,
        config,
    };
    (tracer, reporter)
}

impl Reporter {
    pub async fn start_reporting(mut self) {
        let trace_headers = {
            use reqwest::header::*;
            let mut headers = HeaderMap::new();
            headers.insert(
                "X-Encore-App-Id",
                HeaderValue::from_str(&self.config.app_id).unwrap(),
            );
            headers.insert(
                "X-Encore-Env-Id",
                HeaderValue::from_str(&self.config.env_id).unwrap(),
            );
            headers.insert(
                "X-Encore-Deploy-Id",
                HeaderValue::from_str(&self.config.deploy_id).unwrap(),
            );
            headers.insert(
                "X-Encore-App-Commit",
                HeaderValue::from_str(&self.config.app_commit).unwrap(),
            );
            headers.insert("X-Encore-Trace-Version", HeaderValue::from(TRACE_VERSION));
            headers.insert(
                "X-Encore-Trace-TimeAnchor",
                HeaderValue::from_str(&self.anchor.trace_header()).unwrap(),
            );
            headers
        };

        loop {
            // Block until there is at least one event, then drain whatever
            // else is already queued into the same batch.
            let Some(event) = self.rx.recv().await else {
                // All senders dropped; nothing more will arrive.
                return;
            };

            let mut batch = BytesMut::with_capacity(4096);
            encode_event(&mut batch, &event, &self.anchor);
            while let Ok(event) = self.rx.try_recv() {
                encode_event(&mut batch, &event, &self.anchor);
                if batch.len() >= 1 << 20 {
                    break;
                }
            }
            let body: Bytes = batch.freeze();

            let req = self
                .http_client
                .post(self.config.trace_endpoint.clone())
                .headers(trace_headers.clone())
                .build();
            let mut req = match req {
                Ok(req) => req,
                Err(err) => {
                    log::error!("failed to build trace request: {:?}", err);
                    continue;
                }
            };

            if let Err(err) = self
                .config
                .platform_validator
                .sign_outgoing_request(&mut req)
            {
                log::error!("failed to sign trace request: {:?}", err);
                continue;
            }

            *req.body_mut() = Some(reqwest::Body::from(body));

            match self.http_client.execute(req).await {
                Ok(resp) if !resp.status().is_success() => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    log::error!("failed to send trace: HTTP {}: {}", status, body);
                }
                Err(err) => {
                    log::error!("failed to send trace: {}", err);
                }
                _ => {}
            }
        }
    }
}

/// Each event on the wire is a fixed header followed by the event data:
/// type (1), event id (8), relative timestamp (8), trace id (16),
/// span id (8), data length (4).
fn encode_event(buf: &mut BytesMut, event: &TraceEvent, anchor: &TimeAnchor) {
    let ts = event
        .ts
        .saturating_duration_since(anchor.instant)
        .as_nanos() as i64;
    let ts = signed_to_unsigned_i64(ts);

    buf.reserve(1 + 8 + 8 + 16 + 8 + 4 + event.data.len());
    buf.put_u8(event.typ as u8);
    buf.put_u64_le(event.id.0);
    buf.put_u64_le(ts);
    buf.put_slice(&event.span.0 .0);
    buf.put_slice(&event.span.1 .0);
    buf.put_u32_le(event.data.len() as u32);
    buf.put_slice(&event.data);
}
