use hyper::body::{Body, Frame, SizeHint};
use tokio::sync::{mpsc, oneshot};

use crate::error::ProxyCacheError;

/// Client-side half of a teed upstream download.
///
/// Chunks are fed by the download task. Once the announced length has been
/// yielded, or the channel is drained and closed, the body reports delivery
/// back, so the task only publishes data the client actually consumed.
/// Dropping the body early (client gone) closes the channel and the task
/// abandons the download.
pub(crate) struct ChannelBody {
    receiver: mpsc::Receiver<Result<bytes::Bytes, ProxyCacheError>>,
    delivered: Option<oneshot::Sender<u64>>,
    remaining: SizeHint,
    received: u64,
    complete: bool,
}

impl ChannelBody {
    #[must_use]
    pub(crate) fn new(
        receiver: mpsc::Receiver<Result<bytes::Bytes, ProxyCacheError>>,
        delivered: oneshot::Sender<u64>,
        content_length: Option<u64>,
    ) -> Self {
        let remaining = content_length.map_or_else(SizeHint::new, SizeHint::with_exact);

        let mut body = Self {
            receiver,
            delivered: Some(delivered),
            remaining,
            received: 0,
            complete: false,
        };

        /* An empty body is never polled */
        if content_length == Some(0) {
            body.confirm_delivery();
        }

        body
    }
}

impl Body for ChannelBody {
    type Data = bytes::Bytes;
    type Error = ProxyCacheError;

    fn size_hint(&self) -> SizeHint {
        self.remaining.clone()
    }

    fn is_end_stream(&self) -> bool {
        self.complete
    }

    fn poll_frame(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        if self.is_end_stream() {
            return std::task::Poll::Ready(None);
        }

        let msg = std::task::ready!(self.receiver.poll_recv(cx));

        let item = match msg {
            Some(Ok(data)) => {
                let datalen = data.len() as u64;
                self.received += datalen;
                if let Some(exact) = self.remaining.exact() {
                    let left = exact.saturating_sub(datalen);
                    self.remaining.set_exact(left);
                    /* The connection stops polling once the announced length is written */
                    if left == 0 {
                        self.confirm_delivery();
                    }
                }
                Some(Ok(Frame::data(data)))
            }
            Some(Err(err)) => {
                /* Do not confirm delivery, the download failed */
                self.complete = true;
                self.delivered = None;
                Some(Err(err))
            }
            None => {
                self.complete = true;
                self.confirm_delivery();
                None
            }
        };

        std::task::Poll::Ready(item)
    }
}

impl ChannelBody {
    fn confirm_delivery(&mut self) {
        if let Some(delivered) = self.delivered.take() {
            let _ = delivered.send(self.received);
        }
    }
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt as _;

    use super::*;

    #[tokio::test]
    async fn test_confirms_delivery() {
        let (tx, rx) = mpsc::channel(4);
        let (dtx, drx) = oneshot::channel();
        let body = ChannelBody::new(rx, dtx, Some(10));
        assert_eq!(body.size_hint().exact(), Some(10));

        tx.send(Ok(bytes::Bytes::from_static(b"01234"))).await.unwrap();
        tx.send(Ok(bytes::Bytes::from_static(b"56789"))).await.unwrap();
        drop(tx);

        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(&collected[..], b"0123456789");
        assert_eq!(drx.await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_error_is_not_delivery() {
        let (tx, rx) = mpsc::channel(4);
        let (dtx, drx) = oneshot::channel();
        let body = ChannelBody::new(rx, dtx, None);

        tx.send(Ok(bytes::Bytes::from_static(b"01234"))).await.unwrap();
        tx.send(Err(ProxyCacheError::ShortRead {
            expected: 10,
            received: 5,
        }))
        .await
        .unwrap();
        drop(tx);

        assert!(body.collect().await.is_err());
        assert!(drx.await.is_err());
    }

    #[tokio::test]
    async fn test_dropped_body_is_not_delivery() {
        let (tx, rx) = mpsc::channel(4);
        let (dtx, drx) = oneshot::channel();
        let body = ChannelBody::new(rx, dtx, Some(5));

        drop(body);

        assert!(tx.send(Ok(bytes::Bytes::from_static(b"01234"))).await.is_err());
        assert!(drx.await.is_err());
    }

    #[tokio::test]
    async fn test_confirms_delivery_at_announced_length() {
        let (tx, rx) = mpsc::channel(4);
        let (dtx, drx) = oneshot::channel();
        let mut body = ChannelBody::new(rx, dtx, Some(5));

        tx.send(Ok(bytes::Bytes::from_static(b"01234"))).await.unwrap();

        let frame = body.frame().await.unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap().len(), 5);
        assert_eq!(body.size_hint().exact(), Some(0));
        /* sender still alive */
        assert_eq!(drx.await.unwrap(), 5);
        drop(tx);
    }

    #[tokio::test]
    async fn test_empty_body_confirms_delivery_unpolled() {
        let (tx, rx) = mpsc::channel(4);
        let (dtx, drx) = oneshot::channel();
        let body = ChannelBody::new(rx, dtx, Some(0));

        assert_eq!(body.size_hint().exact(), Some(0));
        drop(body);
        drop(tx);

        assert_eq!(drx.await.unwrap(), 0);
    }
}
