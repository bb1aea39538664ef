use bytes::Bytes;
use futures::Stream;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};

use crate::codec::{Codec, JsonCodec};
use crate::error::{Result, RpcError};

type SinkItem = Result<Bytes>;

/// Creates the three ends of one request: the sink the client writes into,
/// the watch that fires when the consumer lets go, and the consumer's stream.
pub(crate) fn request_channel<T, C>(codec: C) -> (RequestSink, SinkWatch, ResponseStream<T, C>)
where
    T: DeserializeOwned,
    C: Codec,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let (done_tx, done_rx) = oneshot::channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();

    let sink = RequestSink { tx, _done: done_tx };
    let watch = SinkWatch {
        cancel: cancel_rx,
        done: done_rx,
    };
    let stream = ResponseStream {
        rx,
        ended: false,
        codec,
        cancel: Some(cancel_tx),
        _phantom: PhantomData,
    };
    (sink, watch, stream)
}

/// Write side of a request. Dropping it without an error completes the
/// consumer's stream.
#[derive(Debug)]
pub(crate) struct RequestSink {
    tx: mpsc::UnboundedSender<SinkItem>,
    _done: oneshot::Sender<()>,
}

impl RequestSink {
    /// True once the consumer dropped or canceled its stream.
    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub(crate) fn next(&self, payload: Bytes) {
        let _ = self.tx.send(Ok(payload));
    }

    pub(crate) fn error(self, error: RpcError) {
        let _ = self.tx.send(Err(error));
    }

    pub(crate) fn complete(self) {}
}

/// Resolves once the request is over, reporting whether the consumer
/// detached before a terminal notification was delivered.
#[derive(Debug)]
pub(crate) struct SinkWatch {
    cancel: oneshot::Receiver<()>,
    done: oneshot::Receiver<()>,
}

impl SinkWatch {
    pub(crate) async fn canceled(self) -> bool {
        let SinkWatch { cancel, done } = self;
        tokio::select! {
            biased;
            _ = done => false,
            _ = cancel => true,
        }
    }
}

/// Stream of results for one request.
///
/// Ends after the remote side completes, or after the first error. Dropping
/// it (or calling [`ResponseStream::cancel`]) before that disposes the
/// request on the remote side.
pub struct ResponseStream<T, C: Codec = JsonCodec> {
    rx: mpsc::UnboundedReceiver<SinkItem>,
    ended: bool,
    codec: C,
    cancel: Option<oneshot::Sender<()>>,
    _phantom: PhantomData<fn() -> T>,
}

impl<T, C> ResponseStream<T, C>
where
    T: DeserializeOwned,
    C: Codec,
{
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub async fn recv(&mut self) -> Option<Result<T>> {
        if self.ended {
            return None;
        }

        match self.rx.recv().await {
            Some(item) => Some(self.decode(item)),
            None => {
                self.ended = true;
                None
            }
        }
    }

    /// Collects every value, stopping at the first error.
    pub async fn collect(mut self) -> Result<Vec<T>> {
        let mut items = Vec::new();
        while let Some(result) = self.recv().await {
            items.push(result?);
        }
        Ok(items)
    }

    pub fn cancel(&mut self) {
        self.ended = true;
        self.rx.close();
        self.cancel.take();
    }

    fn decode(&mut self, item: SinkItem) -> Result<T> {
        match item {
            Ok(data) => self.codec.decode(&data),
            Err(e) => {
                self.ended = true;
                Err(e)
            }
        }
    }
}

impl<T, C> Stream for ResponseStream<T, C>
where
    T: DeserializeOwned,
    C: Codec + Unpin,
{
    type Item = Result<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.ended {
            return Poll::Ready(None);
        }

        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(item)) => Poll::Ready(Some(self.decode(item))),
            Poll::Ready(None) => {
                self.ended = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T, C: Codec> std::fmt::Debug for ResponseStream<T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseStream")
            .field("ended", &self.ended)
            .finish()
    }
}
