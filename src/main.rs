#![cfg_attr(
    test,
    allow(clippy::map_unwrap_or, clippy::unwrap_used, clippy::too_many_lines)
)]

mod channel_body;
mod config;
mod delivery_body;
mod dns;
mod error;
mod http_date;
mod mirror;
mod mirrorlist;
mod proxy;
mod store;

use std::error::Error;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use http_body_util::{BodyExt, Empty, Full, combinators::BoxBody};
use hyper::header::{CONTENT_TYPE, HOST, HeaderValue, SERVER};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioIo;
use log::{LevelFilter, debug, error, info, trace, warn};
use simplelog::{ColorChoice, ConfigBuilder, TermLogger, TerminalMode};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Builder;
use tokio::signal::unix::SignalKind;

use crate::config::{Config, Overrides};
use crate::error::ProxyCacheError;
use crate::mirror::Route;
use crate::store::CacheStore;

type Client = hyper_util::client::legacy::Client<
    hyper_timeout::TimeoutConnector<HttpsConnector<HttpConnector>>,
    ProxyCacheBody,
>;

type ProxyCacheBody = BoxBody<bytes::Bytes, ProxyCacheError>;

const APP_NAME: &str = env!("CARGO_PKG_NAME");

#[derive(Clone)]
struct State {
    config: Arc<Config>,
    client: Client,
    store: CacheStore,
}

#[must_use]
fn quick_response<T: Into<bytes::Bytes>>(
    status: StatusCode,
    message: T,
) -> Response<ProxyCacheBody> {
    Response::builder()
        .status(status)
        .header(SERVER, HeaderValue::from_static(APP_NAME))
        .header(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        )
        .body(full(message))
        .expect("Response is valid")
}

#[must_use]
fn error_response(err: &ProxyCacheError) -> Response<ProxyCacheBody> {
    let status = err.status_code();

    if err.is_http_shaped() {
        info!("Responding with {status}");
    } else {
        warn!("Responding with {status}:  {err}");
    }

    quick_response(status, format!("{err}\n"))
}

/// Host the client addressed, without port.
#[must_use]
fn requested_host<B>(req: &Request<B>) -> Option<String> {
    if let Some(authority) = req.uri().authority() {
        return Some(authority.host().to_owned());
    }

    let host = req.headers().get(HOST)?.to_str().ok()?;
    match host.parse::<hyper::http::uri::Authority>() {
        Ok(authority) => Some(authority.host().to_owned()),
        Err(err) => {
            debug!("Invalid host header `{host}`:  {err}");
            None
        }
    }
}

async fn handle_request_wrapper(
    client: SocketAddr,
    req: Request<hyper::body::Incoming>,
    state: State,
) -> Result<Response<ProxyCacheBody>, ProxyCacheError> {
    Ok(handle_request(client, req, state).await)
}

#[must_use]
async fn handle_request(
    client: SocketAddr,
    req: Request<hyper::body::Incoming>,
    state: State,
) -> Response<ProxyCacheBody> {
    trace!("Incoming request from {client}: {req:?}");

    let host = requested_host(&req).unwrap_or_default();

    info!(
        "{} http://{}{}",
        req.method(),
        req.headers()
            .get(HOST)
            .and_then(|hv| hv.to_str().ok())
            .unwrap_or(&host),
        req.uri()
            .path_and_query()
            .map_or_else(|| req.uri().path(), |pq| pq.as_str())
    );

    let result = match mirror::route(&host, req.uri().path(), &state.config.upstream) {
        Route::MirrorListFedora => mirrorlist::serve_fedora_mirrorlist(&state, &req).await,
        Route::MirrorListCentOS => Ok(mirrorlist::serve_centos_mirrorlist(&state, &req)),
        Route::Proxy { upstream } => proxy::proxy_request(&state, req, upstream).await,
        Route::NotFound => {
            info!("no upstream found for url {}", req.uri().path());
            Err(ProxyCacheError::NotFound)
        }
    };

    match result {
        Ok(response) => {
            trace!("Outgoing response: {response:?}");
            response
        }
        Err(err) => error_response(&err),
    }
}

#[must_use]
fn empty() -> ProxyCacheBody {
    Empty::<bytes::Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

#[must_use]
fn full<T: Into<bytes::Bytes>>(chunk: T) -> ProxyCacheBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

#[must_use]
fn is_iokind(err: &hyper::Error, kind: std::io::ErrorKind) -> bool {
    err.source()
        .and_then(|err| err.downcast_ref::<std::io::Error>())
        .is_some_and(|ioerr| ioerr.kind() == kind)
}

#[must_use]
fn is_connection_reset(err: &hyper::Error) -> bool {
    is_iokind(err, std::io::ErrorKind::ConnectionReset)
}

#[must_use]
fn is_shutdown_disconnect(err: &hyper::Error) -> bool {
    is_iokind(err, std::io::ErrorKind::NotConnected)
}

#[must_use]
fn is_broken_pipe(err: &hyper::Error) -> bool {
    is_iokind(err, std::io::ErrorKind::BrokenPipe)
}

/// Serves all requests of one client connection.
async fn serve_connection(stream: TcpStream, client: SocketAddr, state: State) {
    let client_start = Instant::now();

    if let Err(err) = http1::Builder::new()
        .serve_connection(
            TokioIo::new(stream),
            service_fn(move |req| handle_request_wrapper(client, req, state.clone())),
        )
        .await
    {
        if err.is_incomplete_message() || is_connection_reset(&err) {
            info!(
                "Connection to client {} cancelled",
                client.ip().to_canonical()
            );
        } else if is_shutdown_disconnect(&err) {
            info!(
                "Improper connection shutdown for client {}:  {err}",
                client.ip().to_canonical()
            );
        } else if is_broken_pipe(&err) {
            info!(
                "Broken pipe for client {}:  {err}",
                client.ip().to_canonical()
            );
        } else {
            error!(
                "Error serving connection for client {}:  {err} -- {err:?}",
                client.ip().to_canonical()
            );
            let mut lerr: &dyn Error = &err;
            while let Some(source) = lerr.source() {
                error!(
                    "Error serving connection for client {}:  {source} -- {source:?}",
                    client.ip().to_canonical()
                );
                lerr = source;
            }
        }
    }

    debug!(
        "Closed connection to {} after {:.2?}",
        client.ip().to_canonical(),
        client_start.elapsed()
    );
}

async fn main_loop(config: Arc<Config>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut addr = config.listen;

    let listener = match TcpListener::bind(addr).await {
        Ok(x) => x,
        Err(err) => {
            if addr.ip() != Ipv6Addr::UNSPECIFIED {
                error!("Error binding on {addr}:  {err}");
                Err(err)?;
            }

            // Fallback to IPv4 to avoid errors when IPv6 is not available and the default configuration is used.
            addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, addr.port()));
            TcpListener::bind(addr).await.map_err(|err| {
                error!("Error binding fallback on {addr}:  {err}");
                err
            })?
        }
    };
    info!("Listening on http://{addr}");

    let client = proxy::build_client(&config)?;
    let store = CacheStore::new(config.data.clone(), config.buffer_size);

    let state = State {
        config,
        client,
        store,
    };

    let mut term_signal = tokio::signal::unix::signal(SignalKind::terminate())?;

    loop {
        let next = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("SIGINT received, stopping...");
                return Ok(());
            },
            _ = term_signal.recv() => {
                info!("SIGTERM received, stopping...");
                return Ok(());
            },
            n = listener.accept() => n
        };

        let (stream, client) = match next {
            Ok(x) => x,
            Err(err) => {
                /* e.g. EMFILE, keep serving established connections */
                error!("Error accepting connection:  {err}");
                continue;
            }
        };

        debug!("New client connection from {}", client.ip().to_canonical());

        tokio::task::spawn(serve_connection(stream, client, state.clone()));
    }
}

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Logging level
    #[arg(short, long, value_name = "SEVERITY")]
    log_level: Option<LevelFilter>,
    /// Configuration file path
    #[arg(
        short = 'c',
        long = "config",
        default_value = config::DEFAULT_CONFIGURATION_PATH,
        value_name = "PATH"
    )]
    config_path: PathBuf,
    /// Skip timestamp in log messages
    #[arg(long, default_value = "false")]
    skip_log_timestamp: bool,
    /// Address to listen on, e.g. `:80` or `192.168.1.2:8080`
    #[arg(long, value_name = "ADDR")]
    listen: Option<String>,
    /// DNS server used to resolve the real mirror-list hosts
    #[arg(long, value_name = "ADDR")]
    dns: Option<String>,
    /// Data storage path (data in here is public)
    #[arg(long, value_name = "PATH")]
    data: Option<PathBuf>,
    /// Host name clients reach this proxy by
    #[arg(long, value_name = "HOST")]
    host: Option<String>,
    /// Base URL of the archive mirror
    #[arg(long, value_name = "URL")]
    upstream: Option<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Cli::parse();

    let overrides = Overrides {
        listen: args.listen,
        dns: args.dns,
        data: args.data,
        host: args.host,
        upstream: args.upstream,
    };

    let (config, cgf_fallback) = Config::new(&args.config_path, overrides)?;

    let output_log_config = if args.skip_log_timestamp {
        ConfigBuilder::new()
            .set_time_level(LevelFilter::Off)
            .build()
    } else {
        simplelog::Config::default()
    };

    TermLogger::init(
        args.log_level.unwrap_or(config.log_level),
        output_log_config,
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )?;

    debug!("Logger initialized");
    trace!("Tracing enabled");

    if cgf_fallback {
        info!(
            "Default configuration file {} not found, using defaults",
            args.config_path.display()
        );
    }

    debug!("Configuration: {config:?}");

    info!("Using data directory `{}`", config.data.display());

    CacheStore::new(config.data.clone(), config.buffer_size)
        .setup()
        .map_err(|err| {
            error!("Error during setup:  {err}");
            err
        })?;

    std::panic::set_hook(Box::new(move |info| {
        error!("{info}");
        eprintln!("{info}");
    }));

    scopeguard::defer! {
        info!("Stopped.");
    }

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .thread_name("remirror-w")
        .build()?;

    runtime.block_on(main_loop(Arc::new(config)))
}
