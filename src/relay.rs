//! Byte streams between caller and upstream
//!
//! Neither direction is buffered in full:
//! - [`RequestBodyStream`] feeds the caller's body frames to the upstream request,
//!   logging a short preview of the first chunk on the way, and can report when the
//!   body has been handed over in full.
//! - [`RelayStream`] feeds upstream response chunks back to the caller. Dropping it
//!   (the caller went away) drops the upstream response and closes that connection.

use crate::error::BoxError;
use bytes::Bytes;
use futures_util::Stream;
use hyper::body::{Body, Frame};
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Body preview length in log lines
pub const PREVIEW_LEN: usize = 200;

/// Lossy UTF-8 preview of at most [`PREVIEW_LEN`] bytes, `...` appended when cut
pub fn preview(data: &[u8]) -> String {
    if data.len() > PREVIEW_LEN {
        format!("{}...", String::from_utf8_lossy(&data[..PREVIEW_LEN]))
    } else {
        String::from_utf8_lossy(data).into_owned()
    }
}

pin_project! {
    /// Outbound request body as a stream of data chunks. Trailers are dropped.
    pub struct RequestBodyStream<B> {
        #[pin]
        body: B,
        log_preview: bool,
        on_end: Option<oneshot::Sender<()>>,
    }
}

impl<B> RequestBodyStream<B> {
    pub fn new(body: B, log_preview: bool) -> Self {
        Self {
            body,
            log_preview,
            on_end: None,
        }
    }

    /// Fire `tx` once the body ends or fails. Dropping the stream drops `tx`,
    /// which the receiver sees as the same outcome.
    pub fn with_end_signal(mut self, tx: oneshot::Sender<()>) -> Self {
        self.on_end = Some(tx);
        self
    }
}

impl<B> Stream for RequestBodyStream<B>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    type Item = Result<Bytes, BoxError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            let frame = match ready!(this.body.as_mut().poll_frame(cx)) {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    signal_end(this.on_end);
                    return Poll::Ready(Some(Err(e.into())));
                }
                None => {
                    signal_end(this.on_end);
                    return Poll::Ready(None);
                }
            };

            if let Ok(data) = frame.into_data() {
                if *this.log_preview && !data.is_empty() {
                    *this.log_preview = false;
                    debug!("  Body Preview: {}", preview(&data));
                }
                return Poll::Ready(Some(Ok(data)));
            }
        }
    }
}

fn signal_end(on_end: &mut Option<oneshot::Sender<()>>) {
    if let Some(tx) = on_end.take() {
        let _ = tx.send(());
    }
}

pin_project! {
    /// Upstream response body relayed chunk by chunk as body frames
    pub struct RelayStream<S> {
        #[pin]
        upstream: S,
        relayed: u64,
        finished: bool,
    }

    impl<S> PinnedDrop for RelayStream<S> {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            if !*this.finished {
                debug!(
                    bytes = *this.relayed,
                    "Caller went away mid-relay, closing upstream response"
                );
            }
        }
    }
}

impl<S> RelayStream<S> {
    pub fn new(upstream: S) -> Self {
        Self {
            upstream,
            relayed: 0,
            finished: false,
        }
    }
}

impl<S, E> Stream for RelayStream<S>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Into<BoxError>,
{
    type Item = Result<Frame<Bytes>, BoxError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();

        if *this.finished {
            return Poll::Ready(None);
        }

        match ready!(this.upstream.poll_next(cx)) {
            Some(Ok(chunk)) => {
                *this.relayed += chunk.len() as u64;
                Poll::Ready(Some(Ok(Frame::data(chunk))))
            }
            Some(Err(e)) => {
                // Status and headers are already with the caller; all that is
                // left is to cut the body short.
                *this.finished = true;
                let e: BoxError = e.into();
                warn!(
                    bytes = *this.relayed,
                    error = %e,
                    "Upstream failed mid-stream, truncating response"
                );
                Poll::Ready(Some(Err(e)))
            }
            None => {
                *this.finished = true;
                debug!(bytes = *this.relayed, "Upstream response relayed");
                Poll::Ready(None)
            }
        }
    }
}
