//! Physical output for a [`ResponseEnvelope`](super::ResponseEnvelope).
//!
//! # Responsibilities
//! - Carry one head (status line + headers, optional first body chunk)
//! - Carry any number of continuation chunks, then end
//! - Report whether the client is still listening
//!
//! # Design Decisions
//! - Writes never block: the HTTP side drains an unbounded channel
//! - A dropped receiver is how a closed connection shows up here

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};

use super::EnvelopeError;

/// Status line and header block of a response.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub reason: String,
    pub headers: HeaderMap,
}

/// Sink for envelope output.
pub trait Transport: Send {
    /// Emit the head, optionally with the first body chunk. Called once.
    fn write_head(&mut self, head: ResponseHead, body: Option<Bytes>) -> Result<(), EnvelopeError>;

    /// Emit a continuation chunk after the head.
    fn write_chunk(&mut self, chunk: Bytes) -> Result<(), EnvelopeError>;

    /// Mark the response complete.
    fn end(&mut self);

    /// Whether the receiving side has gone away.
    fn is_closed(&self) -> bool;
}

type Head = (ResponseHead, Option<Bytes>);

/// Transport feeding an axum response built by [`ResponseReceiver`].
pub struct ChannelTransport {
    head: Option<oneshot::Sender<Head>>,
    body: Option<mpsc::UnboundedSender<Bytes>>,
}

/// HTTP side of a [`ChannelTransport`].
pub struct ResponseReceiver {
    head: oneshot::Receiver<Head>,
    body: mpsc::UnboundedReceiver<Bytes>,
}

impl ChannelTransport {
    pub fn pair() -> (Self, ResponseReceiver) {
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::unbounded_channel();
        (
            Self {
                head: Some(head_tx),
                body: Some(body_tx),
            },
            ResponseReceiver {
                head: head_rx,
                body: body_rx,
            },
        )
    }
}

impl Transport for ChannelTransport {
    fn write_head(&mut self, head: ResponseHead, body: Option<Bytes>) -> Result<(), EnvelopeError> {
        let tx = self
            .head
            .take()
            .ok_or(EnvelopeError::IllegalState("response head written twice"))?;
        tx.send((head, body))
            .map_err(|_| EnvelopeError::ConnectionClosed)
    }

    fn write_chunk(&mut self, chunk: Bytes) -> Result<(), EnvelopeError> {
        match &self.body {
            Some(tx) => tx.send(chunk).map_err(|_| EnvelopeError::ConnectionClosed),
            None => Err(EnvelopeError::IllegalState("body chunk after end")),
        }
    }

    fn end(&mut self) {
        self.head = None;
        self.body = None;
    }

    fn is_closed(&self) -> bool {
        let head_closed = self.head.as_ref().is_some_and(|tx| tx.is_closed());
        let body_closed = self.body.as_ref().map_or(true, |tx| tx.is_closed());
        head_closed || body_closed
    }
}

impl ResponseReceiver {
    /// Wait for the head and stream the body as it is flushed.
    ///
    /// Fails when the producing side dropped without writing a head.
    pub async fn into_response(self) -> Result<Response, oneshot::error::RecvError> {
        let (head, first) = self.head.await?;

        let first = futures_util::stream::iter(first.into_iter().map(Ok::<_, Infallible>));
        let rest = futures_util::stream::unfold(self.body, |mut rx| async move {
            rx.recv().await.map(|chunk| (Ok::<_, Infallible>(chunk), rx))
        });

        let mut response = Response::new(Body::from_stream(first.chain(rest)));
        *response.status_mut() = head.status;
        *response.headers_mut() = head.headers;
        Ok(response)
    }
}

/// One recorded write.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Head(ResponseHead, Option<Bytes>),
    Chunk(Bytes),
    End,
}

/// Transport that records frames in memory.
///
/// Clones share the same log, so a caller can keep one handle while the
/// envelope owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    frames: Arc<Mutex<Vec<Frame>>>,
    closed: Arc<AtomicBool>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.lock().clone()
    }

    /// The recorded head, if one was written.
    pub fn head(&self) -> Option<ResponseHead> {
        self.lock().iter().find_map(|f| match f {
            Frame::Head(head, _) => Some(head.clone()),
            _ => None,
        })
    }

    pub fn head_count(&self) -> usize {
        self.lock()
            .iter()
            .filter(|f| matches!(f, Frame::Head(..)))
            .count()
    }

    /// Body chunks in write order, including one carried by the head.
    pub fn chunks(&self) -> Vec<Bytes> {
        self.lock()
            .iter()
            .filter_map(|f| match f {
                Frame::Head(_, body) => body.clone(),
                Frame::Chunk(chunk) => Some(chunk.clone()),
                Frame::End => None,
            })
            .collect()
    }

    /// The whole body as transmitted.
    pub fn body(&self) -> Bytes {
        let mut body = BytesMut::new();
        for chunk in self.chunks() {
            body.extend_from_slice(&chunk);
        }
        body.freeze()
    }

    pub fn is_ended(&self) -> bool {
        self.lock().iter().any(|f| matches!(f, Frame::End))
    }

    /// Simulate the client disconnecting.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Frame>> {
        self.frames.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, frame: Frame) -> Result<(), EnvelopeError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EnvelopeError::ConnectionClosed);
        }
        self.lock().push(frame);
        Ok(())
    }
}

impl Transport for MemoryTransport {
    fn write_head(&mut self, head: ResponseHead, body: Option<Bytes>) -> Result<(), EnvelopeError> {
        if self.head_count() > 0 {
            return Err(EnvelopeError::IllegalState("response head written twice"));
        }
        self.push(Frame::Head(head, body))
    }

    fn write_chunk(&mut self, chunk: Bytes) -> Result<(), EnvelopeError> {
        self.push(Frame::Chunk(chunk))
    }

    fn end(&mut self) {
        let _ = self.push(Frame::End);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::CONTENT_TYPE;
    use axum::http::HeaderValue;

    fn head() -> ResponseHead {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        ResponseHead {
            status: StatusCode::OK,
            reason: "OK".into(),
            headers,
        }
    }

    #[tokio::test]
    async fn channel_streams_head_and_chunks() {
        let (mut transport, receiver) = ChannelTransport::pair();
        transport
            .write_head(head(), Some(Bytes::from_static(b"{\"a\":1}")))
            .unwrap();
        transport.write_chunk(Bytes::from_static(b"{\"b\":2}")).unwrap();
        transport.end();

        let response = receiver.into_response().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"{\"a\":1}{\"b\":2}");
    }

    #[tokio::test]
    async fn dropped_receiver_closes_channel() {
        let (mut transport, receiver) = ChannelTransport::pair();
        assert!(!transport.is_closed());
        drop(receiver);

        assert!(transport.is_closed());
        assert!(matches!(
            transport.write_head(head(), None),
            Err(EnvelopeError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn producer_dropping_without_head_is_an_error() {
        let (transport, receiver) = ChannelTransport::pair();
        drop(transport);
        assert!(receiver.into_response().await.is_err());
    }

    #[test]
    fn memory_transport_records_and_closes() {
        let log = MemoryTransport::new();
        let mut transport = log.clone();

        transport.write_head(head(), Some(Bytes::from_static(b"x"))).unwrap();
        transport.write_chunk(Bytes::from_static(b"y")).unwrap();
        assert_eq!(log.head_count(), 1);
        assert_eq!(&log.body()[..], b"xy");

        log.close();
        assert!(transport.is_closed());
        assert!(matches!(
            transport.write_chunk(Bytes::from_static(b"z")),
            Err(EnvelopeError::ConnectionClosed)
        ));
    }
}
