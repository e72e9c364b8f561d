//! Streaming sessions and body plumbing.
//!
//! A streaming response (one that declares no fixed length, e.g. an event
//! stream) must be relayed frame-by-frame as the backend produces it.
//! This module owns the shared body type, the streaming-vs-bounded
//! decision, the session registry, and the idle-timeout body adapter that
//! closes a silent stream on both sides.

use bytes::Bytes;
use dashmap::DashMap;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Frame, Incoming};
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use pin_project_lite::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Instant, Sleep};
use tracing::{debug, info};
use uuid::Uuid;

/// Boxed error type carried by proxied bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type flowing through the middleware chain and out to clients.
pub type ProxyBody = BoxBody<Bytes, BoxError>;

/// Create a full (bounded) body.
pub fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

/// Adapt a hyper request/response body into the shared body type.
pub fn boxed_incoming(body: Incoming) -> ProxyBody {
    body.map_err(|e| Box::new(e) as BoxError).boxed()
}

/// Decide whether a backend response is streaming: it declares no fixed
/// total length up front. Event streams always are; any response without
/// a Content-Length (chunked or close-delimited) is treated the same.
pub fn is_streaming_response<B>(resp: &Response<B>) -> bool {
    let status = resp.status();
    if status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return false;
    }

    let content_type = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if content_type.starts_with("text/event-stream") {
        return true;
    }

    !resp.headers().contains_key(CONTENT_LENGTH)
}

/// One live streaming exchange. Not persisted; dropped with the stream.
#[derive(Debug, Clone)]
pub struct StreamSession {
    pub id: Uuid,
    pub host: String,
    pub path: String,
    pub target: String,
    pub opened_at: Instant,
}

/// Registry of currently-open streaming sessions.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<Uuid, StreamSession>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Track a new session; the returned guard removes it when the stream
    /// ends for any reason.
    pub fn register(
        self: &Arc<Self>,
        host: String,
        path: String,
        target: String,
    ) -> SessionGuard {
        let session = StreamSession {
            id: Uuid::new_v4(),
            host,
            path,
            target,
            opened_at: Instant::now(),
        };
        let id = session.id;
        info!(session = %id, host = %session.host, path = %session.path, "Stream session opened");
        self.sessions.insert(id, session);
        SessionGuard {
            id,
            registry: self.clone(),
        }
    }

    pub fn active(&self) -> usize {
        self.sessions.len()
    }
}

/// Removes a session from the registry when the stream body is dropped,
/// whether it completed, errored, timed out, or the client went away.
#[derive(Debug)]
pub struct SessionGuard {
    id: Uuid,
    registry: Arc<SessionRegistry>,
}

impl SessionGuard {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some((_, session)) = self.registry.sessions.remove(&self.id) {
            debug!(
                session = %self.id,
                open_secs = session.opened_at.elapsed().as_secs(),
                "Stream session closed"
            );
        }
    }
}

pin_project! {
    /// Body adapter that ends the stream after an idle window with no
    /// frames in either direction. Frames are forwarded untouched and the
    /// deadline resets on each one, so keep-alive traffic under the
    /// timeout keeps a session open indefinitely. Timeout is normal
    /// termination: the body ends cleanly and dropping the inner body
    /// tears down the backend side.
    pub struct IdleTimeoutBody<B> {
        #[pin]
        inner: B,
        #[pin]
        deadline: Sleep,
        timeout: Duration,
        session_id: Uuid,
        // Dropped with the body; unregisters the session.
        _guard: SessionGuard,
        timed_out: bool,
    }
}

impl<B> IdleTimeoutBody<B> {
    pub fn new(inner: B, timeout: Duration, guard: SessionGuard) -> Self {
        Self {
            inner,
            deadline: tokio::time::sleep(timeout),
            timeout,
            session_id: guard.id(),
            _guard: guard,
            timed_out: false,
        }
    }
}

impl<B> Body for IdleTimeoutBody<B>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, BoxError>>> {
        let mut this = self.project();

        if *this.timed_out {
            return Poll::Ready(None);
        }

        match this.inner.poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                this.deadline.as_mut().reset(Instant::now() + *this.timeout);
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e.into()))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => {
                if this.deadline.poll(cx).is_ready() {
                    *this.timed_out = true;
                    info!(session = %this.session_id, "Stream idle timeout; closing both sides");
                    Poll::Ready(None)
                } else {
                    Poll::Pending
                }
            }
        }
    }
}
