//! Mirror lists pointing package managers back at this proxy.
//!
//! CentOS lists are synthesised locally. Fedora and EPEL metalinks are fetched
//! from the real host and, for the configured EPEL repositories, have their
//! mirror resources replaced by a single entry naming this proxy.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use http_body_util::BodyExt as _;
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE, HOST, HeaderValue, SERVER};
use hyper::{Request, Response, StatusCode};
use log::{debug, info, warn};

use crate::error::ProxyCacheError;
use crate::mirror::FEDORA_MIRRORS_HOST;
use crate::{APP_NAME, ProxyCacheBody, State, empty, full};

const RESOURCES_START: &str = r#"<resources maxconnections="1">"#;
const RESOURCES_END: &str = "</resources>";

/// Form parameters shared by the mirror-list protocols.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct MirrorListQuery {
    pub(crate) release: String,
    pub(crate) repo: String,
    pub(crate) arch: String,
}

impl MirrorListQuery {
    /// Parses an URL query string. Missing parameters are empty, the first
    /// occurrence of a repeated parameter wins.
    #[must_use]
    pub(crate) fn parse(query: Option<&str>) -> Self {
        let mut release = None;
        let mut repo = None;
        let mut arch = None;

        for (name, value) in url::form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
            let slot = match name.as_ref() {
                "release" => &mut release,
                "repo" => &mut repo,
                "arch" => &mut arch,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(value.into_owned());
            }
        }

        Self {
            release: release.unwrap_or_default(),
            repo: repo.unwrap_or_default(),
            arch: arch.unwrap_or_default(),
        }
    }
}

#[must_use]
pub(crate) fn centos_mirrorlist(
    query: &MirrorListQuery,
    host: &str,
    release_pins: &BTreeMap<String, String>,
) -> String {
    let release = release_pins
        .get(&query.release)
        .unwrap_or(&query.release);

    format!(
        "http://{host}/centos/{release}/{}/{}/",
        query.repo, query.arch
    )
}

/// Answers a CentOS mirror-list request without contacting any upstream.
#[must_use]
pub(crate) fn serve_centos_mirrorlist<B>(state: &State, req: &Request<B>) -> Response<ProxyCacheBody> {
    let query = MirrorListQuery::parse(req.uri().query());
    let mirrorlist = centos_mirrorlist(&query, &state.config.host, &state.config.centos_release_pins);

    info!("returned fudged CentOS mirrorlist {mirrorlist}");

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, HeaderValue::from_static("text/plain"))
        .header(SERVER, HeaderValue::from_static(APP_NAME))
        .body(full(mirrorlist))
        .expect("HTTP response is valid")
}

/// Replaces the mirror resources of an EPEL metalink with `url`.
///
/// Returns `None` if the document lacks the resource delimiters.
#[must_use]
pub(crate) fn splice_metalink(document: &str, url: &str) -> Option<String> {
    let start = document.find(RESOURCES_START)?;
    let end = start + document[start..].find(RESOURCES_END)? + RESOURCES_END.len();

    let mut spliced = String::with_capacity(document.len() - (end - start) + url.len());
    spliced.push_str(&document[..start]);
    spliced.push_str(url);
    spliced.push_str(&document[end..]);

    Some(spliced)
}

/// Rewrites a Fedora metalink for the configured EPEL repositories.
///
/// Returns `None` when the document is to be forwarded unchanged.
#[must_use]
pub(crate) fn rewrite_metalink(
    document: &str,
    query: &MirrorListQuery,
    host: &str,
    rewrite_repos: &[String],
) -> Option<String> {
    if !rewrite_repos.iter().any(|repo| *repo == query.repo) {
        return None;
    }

    let release = query.repo.strip_prefix("epel-")?;
    let url = format!(
        r#"<url protocol="http" type="http" location="US" preference="100">http://{host}/fedora-epel/{release}/{}/repodata/repomd.xml</url>"#,
        query.arch
    );

    let rewritten = splice_metalink(document, &url);
    if rewritten.is_none() {
        warn!(
            "Metalink for {} lacks the expected resources element, forwarding unchanged",
            query.repo
        );
    }
    rewritten
}

/// Answers a Fedora/EPEL mirror-list request from the real mirror-list host.
pub(crate) async fn serve_fedora_mirrorlist<B>(
    state: &State,
    req: &Request<B>,
) -> Result<Response<ProxyCacheBody>, ProxyCacheError> {
    let ip = crate::dns::resolve(
        FEDORA_MIRRORS_HOST,
        state.config.dns,
        state.config.dns_timeout,
    )
    .await?;

    debug!("Resolved {FEDORA_MIRRORS_HOST} to {ip}");

    let addr = SocketAddr::new(ip.into(), state.config.fedora_mirrors_port);
    fetch_fedora_mirrorlist(state, addr, req).await
}

/// Fetches the metalink for `req` from `addr`, presenting the real host name.
pub(crate) async fn fetch_fedora_mirrorlist<B>(
    state: &State,
    addr: SocketAddr,
    req: &Request<B>,
) -> Result<Response<ProxyCacheBody>, ProxyCacheError> {
    let query = MirrorListQuery::parse(req.uri().query());
    let request_uri = req
        .uri()
        .path_and_query()
        .map_or_else(|| req.uri().path(), |pq| pq.as_str());

    info!("--> http://{FEDORA_MIRRORS_HOST}{request_uri}");

    let fwd_request = Request::get(format!("http://{addr}{request_uri}"))
        .header(HOST, HeaderValue::from_static(FEDORA_MIRRORS_HOST))
        .body(empty())?;

    let fwd_response = state.client.request(fwd_request).await?;

    let status = fwd_response.status();
    if status != StatusCode::OK {
        warn!("Mirror list request for {request_uri} failed with upstream status {status}");
        return Err(ProxyCacheError::UpstreamStatus(status));
    }

    let content_type = fwd_response.headers().get(CONTENT_TYPE).cloned();
    let body = fwd_response.into_body().collect().await?.to_bytes();

    let body = match std::str::from_utf8(&body) {
        Ok(document) => {
            match rewrite_metalink(document, &query, &state.config.host, &state.config.epel_rewrite_repos) {
                Some(rewritten) => {
                    info!(
                        "returned fudged mirrorlist for {} ({})",
                        query.repo, query.arch
                    );
                    bytes::Bytes::from(rewritten)
                }
                None => body,
            }
        }
        Err(err) => {
            debug!("Mirror list for {request_uri} is not UTF-8, forwarding unchanged:  {err}");
            body
        }
    };

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_LENGTH, HeaderValue::from(body.len()))
        .header(SERVER, HeaderValue::from_static(APP_NAME));
    if let Some(content_type) = content_type {
        builder = builder.header(CONTENT_TYPE, content_type);
    }

    Ok(builder.body(full(body))?)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use http_body_util::Full;

    use super::*;
    use crate::tests::{spawn_upstream, test_config, test_state};

    const METALINK: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<metalink version="3.0" xmlns="http://www.metalinker.org/">
 <files>
  <file name="repomd.xml">
   <resources maxconnections="1">
    <url protocol="https" type="https" location="DE" preference="100">https://ftp.example.org/epel/7/x86_64/repodata/repomd.xml</url>
   </resources>
  </file>
 </files>
</metalink>
"#;

    const EPEL_URL: &str = r#"<url protocol="http" type="http" location="US" preference="100">http://p/fedora-epel/7/x86_64/repodata/repomd.xml</url>"#;

    fn query(repo: &str, arch: &str) -> MirrorListQuery {
        MirrorListQuery {
            repo: repo.to_owned(),
            arch: arch.to_owned(),
            ..MirrorListQuery::default()
        }
    }

    #[test]
    fn test_parse_query() {
        assert_eq!(
            MirrorListQuery::parse(Some("release=7&repo=os&arch=x86_64")),
            MirrorListQuery {
                release: "7".to_owned(),
                repo: "os".to_owned(),
                arch: "x86_64".to_owned(),
            }
        );
        assert_eq!(
            MirrorListQuery::parse(Some("repo=epel-7&repo=other&arch=x86%5F64&foo")),
            query("epel-7", "x86_64")
        );
        assert_eq!(MirrorListQuery::parse(None), MirrorListQuery::default());
    }

    #[test]
    fn test_centos_mirrorlist() {
        let pins = BTreeMap::from([("7".to_owned(), "7.2.1511".to_owned())]);

        let q = MirrorListQuery::parse(Some("release=7&repo=os&arch=x86_64"));
        assert_eq!(
            centos_mirrorlist(&q, "p", &pins),
            "http://p/centos/7.2.1511/os/x86_64/"
        );

        let q = MirrorListQuery::parse(Some("release=6&repo=updates&arch=i386"));
        assert_eq!(
            centos_mirrorlist(&q, "p", &pins),
            "http://p/centos/6/updates/i386/"
        );
    }

    #[test]
    fn test_splice_metalink() {
        let document = r#"head<resources maxconnections="1">OLD</resources>tail"#;
        assert_eq!(
            splice_metalink(document, "<url>new</url>").unwrap(),
            "head<url>new</url>tail"
        );

        assert!(splice_metalink("head</resources>tail", "<url/>").is_none());
        /* closing tag before the opening one */
        assert!(
            splice_metalink(r#"</resources><resources maxconnections="1">"#, "<url/>").is_none()
        );
    }

    #[test]
    fn test_rewrite_metalink() {
        let repos = vec!["epel-7".to_owned()];

        let rewritten = rewrite_metalink(METALINK, &query("epel-7", "x86_64"), "p", &repos).unwrap();
        assert!(rewritten.contains(EPEL_URL));
        assert!(!rewritten.contains("ftp.example.org"));
        assert!(!rewritten.contains(RESOURCES_END));
        assert!(rewritten.ends_with("</file>\n </files>\n</metalink>\n"));

        assert!(rewrite_metalink(METALINK, &query("fedora-26", "x86_64"), "p", &repos).is_none());
        assert!(rewrite_metalink(METALINK, &query("epel-8", "x86_64"), "p", &repos).is_none());

        let repos = vec!["epel-7".to_owned(), "epel-8".to_owned()];
        let rewritten = rewrite_metalink(METALINK, &query("epel-8", "aarch64"), "p", &repos).unwrap();
        assert!(rewritten.contains("http://p/fedora-epel/8/aarch64/repodata/repomd.xml"));
    }

    async fn fetch(document: &'static str, status: StatusCode, uri: &str) -> (Result<Response<ProxyCacheBody>, ProxyCacheError>, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        let upstream = spawn_upstream(move |req| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
            assert_eq!(req.headers().get(HOST).unwrap(), FEDORA_MIRRORS_HOST);
            Response::builder()
                .status(status)
                .header(CONTENT_TYPE, "application/metalink+xml")
                .body(Full::new(bytes::Bytes::from_static(document.as_bytes())))
                .unwrap()
        })
        .await;

        let dir = tempfile::tempdir().unwrap();
        let state = test_state(test_config(dir.path(), "http://127.0.0.1:9"));
        let req = Request::get(format!("http://{FEDORA_MIRRORS_HOST}{uri}"))
            .body(())
            .unwrap();

        (fetch_fedora_mirrorlist(&state, upstream, &req).await, hits)
    }

    #[tokio::test]
    async fn test_fedora_epel_splice() {
        let (response, hits) = fetch(
            r#"<a><resources maxconnections="1">OLD</resources></a>"#,
            StatusCode::OK,
            "/metalink?repo=epel-7&arch=x86_64",
        )
        .await;
        let response = response.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let expected = format!("<a>{EPEL_URL}</a>");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(SERVER).unwrap(), APP_NAME);
        assert_eq!(
            response.headers().get(CONTENT_LENGTH).unwrap(),
            &expected.len().to_string()
        );
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/metalink+xml"
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, expected.as_bytes());
    }

    #[tokio::test]
    async fn test_fedora_passthrough() {
        let (response, _) = fetch(METALINK, StatusCode::OK, "/metalink?repo=fedora-26&arch=x86_64").await;
        let body = response.unwrap().into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, METALINK.as_bytes());
    }

    #[tokio::test]
    async fn test_fedora_upstream_status() {
        let (response, hits) = fetch(METALINK, StatusCode::NOT_FOUND, "/metalink?repo=epel-7&arch=x86_64").await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let err = response.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }
}
