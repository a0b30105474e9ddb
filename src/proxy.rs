use std::time::Instant;

use futures_util::TryStreamExt as _;
use http_body_util::BodyExt as _;
use hyper::body::{Frame, Incoming};
use hyper::header::{CONTENT_LENGTH, HOST, HeaderValue, LAST_MODIFIED, SERVER};
use hyper::{Method, Request, Response, StatusCode};
use hyper_rustls::ConfigBuilderExt as _;
use log::{debug, error, info, trace, warn};
use tokio::sync::{mpsc, oneshot};

use crate::channel_body::ChannelBody;
use crate::config::Config;
use crate::delivery_body::DeliveryStreamBody;
use crate::error::ProxyCacheError;
use crate::http_date::systemtime_to_http_datetime;
use crate::mirror::{CacheKey, should_cache};
use crate::store::{CacheLookup, CacheStore, CachedFile, PendingFile};
use crate::{APP_NAME, Client, ProxyCacheBody, State};

/// Chunks buffered between the upstream reader and the client connection.
const CHANNEL_CAPACITY: usize = 16;

pub(crate) fn build_client(config: &Config) -> anyhow::Result<Client> {
    /* Set a process wide default crypto provider. */
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let tls_cfg = match rustls::ClientConfig::builder().with_native_roots() {
        Ok(builder) => builder.with_no_client_auth(),
        Err(err) => {
            warn!("Failed to load native root certificates, https upstreams will fail:  {err}");
            rustls::ClientConfig::builder()
                .with_root_certificates(rustls::RootCertStore::empty())
                .with_no_client_auth()
        }
    };

    let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls_cfg)
        .https_or_http()
        .enable_http1()
        .build();

    let mut timeout_connector = hyper_timeout::TimeoutConnector::new(https_connector);
    let http_timeout = match config.http_timeout {
        x if x.is_zero() => None,
        x => Some(x),
    };
    debug!("Using http timeout of {http_timeout:?}");
    timeout_connector.set_connect_timeout(http_timeout);
    timeout_connector.set_read_timeout(http_timeout);
    timeout_connector.set_write_timeout(http_timeout);

    Ok(
        hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
            .build(timeout_connector),
    )
}

#[must_use]
fn serve_cached_file(state: &State, key: CacheKey, cached: CachedFile) -> Response<ProxyCacheBody> {
    info!(
        "Serving cached file {key} from `{}` (size={})",
        cached.path.display(),
        cached.size
    );

    let reader_stream =
        tokio_util::io::ReaderStream::with_capacity(cached.file, state.config.buffer_size);
    let delivery_body =
        DeliveryStreamBody::new(reader_stream.map_ok(Frame::data), key, cached.size);

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_LENGTH, HeaderValue::from(cached.size))
        .header(SERVER, HeaderValue::from_static(APP_NAME));

    if let Some(date) = cached.modified.and_then(systemtime_to_http_datetime) {
        builder = builder.header(LAST_MODIFIED, date);
    }

    builder
        .body(delivery_body.map_err(ProxyCacheError::Io).boxed())
        .expect("HTTP response is valid")
}

/// Proxies a request to `upstream`, serving and filling the cache for cacheable paths.
pub(crate) async fn proxy_request(
    state: &State,
    req: Request<Incoming>,
    upstream: &str,
) -> Result<Response<ProxyCacheBody>, ProxyCacheError> {
    let is_get = req.method() == Method::GET;

    let cache_key = if is_get && should_cache(req.uri().path()) {
        let key = CacheKey::from_request_path(req.uri().path());
        if key.is_none() {
            warn!("Not caching invalid path {}", req.uri().path());
        }
        key
    } else {
        None
    };

    if let Some(key) = &cache_key {
        match state.store.open_for_read(key).await {
            Ok(CacheLookup::Hit(cached)) => {
                return Ok(serve_cached_file(state, key.clone(), cached));
            }
            Ok(CacheLookup::Miss) => debug!("Cache miss for {key}"),
            Err(err) => {
                error!("Error opening cached file {key}:  {err}");
                return Err(err.into());
            }
        }
    }

    let url = format!(
        "{upstream}{}",
        req.uri()
            .path_and_query()
            .map_or_else(|| req.uri().path(), |pq| pq.as_str())
    );
    info!("--> {url}");

    let (parts, body) = req.into_parts();

    let mut fwd_request = Request::builder()
        .method(parts.method)
        .uri(&url)
        .body(body.map_err(ProxyCacheError::Hyper).boxed())?;

    for (name, value) in &parts.headers {
        if name != HOST {
            fwd_request.headers_mut().append(name.clone(), value.clone());
        }
    }

    trace!("Forwarded request: {fwd_request:?}");

    let fwd_response = state.client.request(fwd_request).await.map_err(|err| {
        warn!("Proxy request to {url} failed:  {err}");
        err
    })?;

    trace!("Forwarded response: {fwd_response:?}");

    let status = fwd_response.status();
    let content_length = fwd_response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|hv| hv.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok());

    let (mut parts, body) = fwd_response.into_parts();
    parts
        .headers
        .insert(SERVER, HeaderValue::from_static(APP_NAME));
    if let Some(len) = content_length {
        parts.headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
    }

    if !is_get {
        /* e.g. HEAD, whose announced length has no body behind it */
        return Ok(Response::from_parts(
            parts,
            body.map_err(ProxyCacheError::Hyper).boxed(),
        ));
    }

    let tee = match cache_key {
        Some(key) if status == StatusCode::OK => {
            if content_length.is_some() {
                let pending = state.store.begin_write().await.map_err(|err| {
                    error!("Error creating temporary file for {key}:  {err}");
                    err
                })?;
                Some((pending, key))
            } else {
                warn!("Upstream response for {key} has no content length, not caching");
                None
            }
        }
        Some(key) => {
            info!("Not caching {key} with upstream status {status}");
            None
        }
        None => None,
    };

    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (delivered_tx, delivered_rx) = oneshot::channel();

    tokio::task::spawn(tee_body(
        TeeSource {
            body,
            content_length,
            url,
        },
        tee,
        tx,
        delivered_rx,
        state.store.clone(),
    ));

    Ok(Response::from_parts(
        parts,
        ChannelBody::new(rx, delivered_tx, content_length).boxed(),
    ))
}

struct TeeSource<B> {
    body: B,
    content_length: Option<u64>,
    url: String,
}

/// Streams the upstream body to the client and, when `tee` is set, into the
/// temporary file, which is published only after a complete and delivered transfer.
async fn tee_body<B>(
    source: TeeSource<B>,
    mut tee: Option<(PendingFile, CacheKey)>,
    tx: mpsc::Sender<Result<bytes::Bytes, ProxyCacheError>>,
    delivered: oneshot::Receiver<u64>,
    store: CacheStore,
) where
    B: hyper::body::Body<Data = bytes::Bytes> + Unpin,
    B::Error: Into<ProxyCacheError> + std::fmt::Display,
{
    let TeeSource {
        mut body,
        content_length,
        url,
    } = source;

    let start = Instant::now();
    let mut received: u64 = 0;

    while let Some(next) = body.frame().await {
        let frame = match next {
            Ok(f) => f,
            Err(err) => {
                match content_length {
                    Some(expected) => warn!(
                        "Short data returned from server (Content-Length {expected} received {received}) for {url}:  {err}"
                    ),
                    None => warn!("Error receiving body of {url} after {received} bytes:  {err}"),
                }
                let _ = tx.send(Err(err.into())).await;
                abort(tee).await;
                return;
            }
        };

        let Ok(chunk) = frame.into_data() else {
            continue;
        };
        received += chunk.len() as u64;

        let write_failed = match &mut tee {
            Some((pending, key)) => match pending.write(&chunk).await {
                Ok(()) => false,
                Err(err) => {
                    error!(
                        "Error writing to file `{}` for {key}, continuing without caching:  {err}",
                        pending.path().display()
                    );
                    true
                }
            },
            None => false,
        };
        if write_failed {
            abort(tee.take()).await;
        }

        if tx.send(Ok(chunk)).await.is_err() {
            info!("Client went away while receiving {url}, abandoning transfer after {received} bytes");
            abort(tee).await;
            return;
        }
    }

    if let Some(expected) = content_length
        && received != expected
    {
        let err = ProxyCacheError::ShortRead { expected, received };
        warn!("{err} for {url}");
        let _ = tx.send(Err(err)).await;
        abort(tee).await;
        return;
    }

    drop(tx);

    let Some((pending, key)) = tee else {
        debug!("Streamed {url} ({received} bytes in {:.2?})", start.elapsed());
        return;
    };

    match delivered.await {
        Ok(delivered_bytes) if delivered_bytes == received => (),
        _ => {
            info!("Client did not receive {key} completely, not caching");
            pending.abort().await;
            return;
        }
    }

    match pending.commit(&store, &key).await {
        Ok(path) => info!(
            "Cached {key} at `{}` ({received} bytes in {:.2?})",
            path.display(),
            start.elapsed()
        ),
        Err(err) => error!("Failed to publish {key}:  {err}"),
    }
}

async fn abort(tee: Option<(PendingFile, CacheKey)>) {
    if let Some((pending, key)) = tee {
        debug!("Discarding incomplete download of {key}");
        pending.abort().await;
    }
}

#[cfg(test)]
mod tests {
    use http_body_util::{BodyExt as _, StreamBody};

    use super::*;

    const PACKAGE_PATH: &str = "/centos/7/os/x86_64/Packages/bash.rpm";

    type UpstreamFrames = StreamBody<
        futures_util::stream::Iter<std::vec::IntoIter<Result<Frame<bytes::Bytes>, hyper::Error>>>,
    >;

    fn upstream_body(chunks: usize, chunk_len: usize) -> TeeSource<UpstreamFrames> {
        let frames: Vec<Result<Frame<bytes::Bytes>, hyper::Error>> = (0..chunks)
            .map(|_| Ok(Frame::data(bytes::Bytes::from(vec![7u8; chunk_len]))))
            .collect();

        TeeSource {
            body: StreamBody::new(futures_util::stream::iter(frames)),
            content_length: Some((chunks * chunk_len) as u64),
            url: format!("http://upstream.invalid{PACKAGE_PATH}"),
        }
    }

    #[tokio::test]
    async fn test_tee_publishes_delivered_download() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path().to_path_buf(), 4096);
        let key = CacheKey::from_request_path(PACKAGE_PATH).unwrap();
        let pending = store.begin_write().await.unwrap();

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (delivered_tx, delivered_rx) = oneshot::channel();
        let task = tokio::spawn(tee_body(
            upstream_body(4, 1000),
            Some((pending, key.clone())),
            tx,
            delivered_rx,
            store.clone(),
        ));

        let received = ChannelBody::new(rx, delivered_tx, Some(4000))
            .collect()
            .await
            .unwrap()
            .to_bytes();
        assert_eq!(received.len(), 4000);
        task.await.unwrap();

        let CacheLookup::Hit(cached) = store.open_for_read(&key).await.unwrap() else {
            panic!("expected {key} to be published");
        };
        assert_eq!(cached.size, 4000);
    }

    #[tokio::test]
    async fn test_tee_write_error_keeps_streaming() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path().to_path_buf(), 4096);
        let key = CacheKey::from_request_path(PACKAGE_PATH).unwrap();

        /* every write to /dev/full fails with ENOSPC */
        let tmp_path = dir.path().join(format!("{}devfull", crate::store::TMP_PREFIX));
        std::fs::write(&tmp_path, b"").unwrap();
        let dev_full = tokio::fs::File::options()
            .write(true)
            .open("/dev/full")
            .await
            .unwrap();
        let pending = PendingFile::from_file(dev_full, tmp_path.clone(), 1);

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (delivered_tx, delivered_rx) = oneshot::channel();
        let task = tokio::spawn(tee_body(
            upstream_body(4, 1000),
            Some((pending, key.clone())),
            tx,
            delivered_rx,
            store.clone(),
        ));

        let received = ChannelBody::new(rx, delivered_tx, Some(4000))
            .collect()
            .await
            .unwrap()
            .to_bytes();
        assert_eq!(received.len(), 4000);
        assert!(received.iter().all(|b| *b == 7));
        task.await.unwrap();

        assert!(!tmp_path.exists());
        assert!(matches!(
            store.open_for_read(&key).await.unwrap(),
            CacheLookup::Miss
        ));
    }
}
