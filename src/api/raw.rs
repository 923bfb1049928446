//! Body capture for raw endpoints.
//!
//! Raw handlers own the HTTP exchange directly, so the pipeline tees
//! both bodies into bounded buffers and emits them as BodyStream trace
//! events once the stream completes.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};

use crate::model;
use crate::trace::{BodyStreamData, Tracer};

/// How much of a raw request body is captured for tracing.
pub const MAX_RAW_REQUEST_CAPTURE_LEN: usize = 10 * 1024;

/// How much of a raw response body is captured for tracing.
pub const MAX_RAW_RESPONSE_CAPTURE_LEN: usize = 10 * 1024;

/// The capture buffer shared between the tee and the emitter.
#[derive(Debug)]
pub struct Capture {
    limit: usize,
    state: Mutex<CaptureState>,
}

#[derive(Debug)]
struct CaptureState {
    buf: BytesMut,
    overflowed: bool,
}

impl Capture {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            limit,
            state: Mutex::new(CaptureState {
                buf: BytesMut::new(),
                overflowed: false,
            }),
        })
    }

    /// Appends data, keeping at most `limit` bytes. Anything past the
    /// limit is dropped and flips the overflowed flag.
    pub fn push(&self, data: &[u8]) {
        let mut state = self.state.lock().unwrap();
        let remaining = self.limit.saturating_sub(state.buf.len());
        if data.len() > remaining {
            state.overflowed = true;
        }
        let take = remaining.min(data.len());
        if take > 0 {
            let chunk = &data[..take];
            state.buf.extend_from_slice(chunk);
        }
    }

    pub fn captured(&self) -> (Bytes, bool) {
        let state = self.state.lock().unwrap();
        (Bytes::copy_from_slice(&state.buf), state.overflowed)
    }
}

/// Tees an HTTP body into a bounded capture buffer, emitting a
/// BodyStream trace event when the body is done.
pub struct CaptureBody {
    inner: axum::body::Body,
    capture: Arc<Capture>,
    emitter: Option<Emitter>,
}

struct Emitter {
    tracer: Tracer,
    source: Arc<model::Request>,
    is_response: bool,
}

impl CaptureBody {
    pub fn request(
        body: axum::body::Body,
        tracer: Tracer,
        source: Arc<model::Request>,
    ) -> (axum::body::Body, Arc<Capture>) {
        Self::wrap(body, MAX_RAW_REQUEST_CAPTURE_LEN, tracer, source, false)
    }

    pub fn response(
        body: axum::body::Body,
        tracer: Tracer,
        source: Arc<model::Request>,
    ) -> (axum::body::Body, Arc<Capture>) {
        Self::wrap(body, MAX_RAW_RESPONSE_CAPTURE_LEN, tracer, source, true)
    }

    fn wrap(
        body: axum::body::Body,
        limit: usize,
        tracer: Tracer,
        source: Arc<model::Request>,
        is_response: bool,
    ) -> (axum::body::Body, Arc<Capture>) {
        let capture = Capture::new(limit);
        let wrapped = CaptureBody {
            inner: body,
            capture: capture.clone(),
            emitter: Some(Emitter {
                tracer,
                source,
                is_response,
            }),
        };
        (axum::body::Body::new(wrapped), capture)
    }

    fn emit(&mut self) {
        let Some(emitter) = self.emitter.take() else {
            return;
        };
        let (data, overflowed) = self.capture.captured();
        emitter.tracer.body_stream(BodyStreamData {
            source: &emitter.source,
            is_response: emitter.is_response,
            overflowed,
            data: &data,
        });
    }
}

impl http_body::Body for CaptureBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.capture.push(data);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(err))) => {
                this.emit();
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                this.emit();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn size_hint(&self) -> http_body::SizeHint {
        http_body::Body::size_hint(&self.inner)
    }
}

impl Drop for CaptureBody {
    fn drop(&mut self) {
        // The stream may be dropped before completion (e.g. the handler
        // never reads the request body); whatever was seen still counts.
        self.emit();
    }
}
