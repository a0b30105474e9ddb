use std::task::Poll::{Pending, Ready};
use std::time::Instant;

use hyper::body::{Body, Frame, SizeHint};
use log::{info, warn};
use pin_project::{pin_project, pinned_drop};

use crate::mirror::CacheKey;

/* Adopted from http_body_util::StreamBody */
/// Body of a cache hit, logging the outcome of the delivery when dropped.
#[pin_project(PinnedDrop)]
pub(crate) struct DeliveryStreamBody<S> {
    #[pin]
    stream: S,
    key: CacheKey,
    start: Instant,
    size: u64,
    transferred_bytes: u64,
    error: Option<String>,
}

impl<S> DeliveryStreamBody<S> {
    #[must_use]
    pub(crate) fn new(stream: S, key: CacheKey, size: u64) -> Self {
        Self {
            stream,
            key,
            start: Instant::now(),
            size,
            transferred_bytes: 0,
            error: None,
        }
    }
}

impl<S, D, E: ToString> Body for DeliveryStreamBody<S>
where
    S: futures_util::Stream<Item = Result<Frame<D>, E>>,
    D: bytes::Buf,
{
    type Data = D;
    type Error = E;

    fn poll_frame(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        match this.stream.poll_next(cx) {
            Ready(Some(result)) => {
                match &result {
                    Ok(frame) => {
                        if let Some(data) = frame.data_ref() {
                            *this.transferred_bytes += data.remaining() as u64;
                        }
                    }
                    Err(err) => *this.error = Some(err.to_string()),
                }
                Ready(Some(result))
            }
            Pending => Pending,
            Ready(None) => Ready(None),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match self.size.checked_sub(self.transferred_bytes) {
            Some(val) => SizeHint::with_exact(val),
            None => SizeHint::default(),
        }
    }
}

#[pinned_drop]
impl<S> PinnedDrop for DeliveryStreamBody<S> {
    fn drop(self: std::pin::Pin<&mut Self>) {
        let duration = self.start.elapsed();

        if self.transferred_bytes == self.size {
            info!(
                "Served cached file {} in {duration:.2?} (size={})",
                self.key, self.size
            );
        } else {
            warn!(
                "Failed to serve cached file {} after {duration:.2?} (size={}, transferred={}):  {}",
                self.key,
                self.size,
                self.transferred_bytes,
                self.error.as_deref().unwrap_or("client disconnected"),
            );
        }
    }
}
