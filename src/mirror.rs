/// Hosts whose mirror-list documents get intercepted.
pub(crate) const FEDORA_MIRRORS_HOST: &str = "mirrors.fedoraproject.org";
pub(crate) const CENTOS_MIRRORLIST_HOST: &str = "mirrorlist.centos.org";

/// Path prefixes served from the archive mirror.
const UPSTREAM_PREFIXES: [&str; 4] = ["/archlinux/", "/centos/", "/fedora/", "/fedora-epel/"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Route<'a> {
    MirrorListFedora,
    MirrorListCentOS,
    Proxy { upstream: &'a str },
    NotFound,
}

/// Decides how a request is answered, purely from its host and path.
#[must_use]
pub(crate) fn route<'a>(host: &str, path: &str, upstream: &'a str) -> Route<'a> {
    match host {
        FEDORA_MIRRORS_HOST => Route::MirrorListFedora,
        CENTOS_MIRRORLIST_HOST => Route::MirrorListCentOS,
        _ => match upstream_for(path, upstream) {
            Some(upstream) => Route::Proxy { upstream },
            None => Route::NotFound,
        },
    }
}

/// Returns the upstream base URL the request path is appended to.
#[must_use]
pub(crate) fn upstream_for<'a>(path: &str, upstream: &'a str) -> Option<&'a str> {
    UPSTREAM_PREFIXES
        .iter()
        .any(|prefix| path.starts_with(prefix))
        .then_some(upstream)
}

/// Whether the resource never changes once published upstream.
///
/// Packages and compressed repository metadata are named by content,
/// anything else (e.g. `repomd.xml`, `lastsync`) is streamed.
#[must_use]
pub(crate) fn should_cache(path: &str) -> bool {
    if path.ends_with(".pkg.tar.xz") || path.ends_with(".rpm") {
        return true;
    }

    path.contains("/repodata/")
        && (path.ends_with(".gz") || path.ends_with(".bz2") || path.ends_with(".xz"))
}

/// A request path after lexical cleaning, rooted at `/`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct CacheKey(String);

impl CacheKey {
    /// Collapses duplicate slashes and resolves `.` and `..` segments.
    ///
    /// Returns `None` for paths climbing above the root, paths naming the root
    /// itself and segments containing NUL bytes.
    #[must_use]
    pub(crate) fn from_request_path(path: &str) -> Option<Self> {
        let mut segments: Vec<&str> = Vec::new();

        for segment in path.split('/') {
            match segment {
                "" | "." => (),
                ".." => {
                    segments.pop()?;
                }
                s if s.contains('\0') => return None,
                s => segments.push(s),
            }
        }

        if segments.is_empty() {
            return None;
        }

        Some(Self(format!("/{}", segments.join("/"))))
    }

    #[must_use]
    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }

    /// The key without its leading slash, suitable for joining onto a directory.
    #[must_use]
    pub(crate) fn relative(&self) -> &str {
        &self.0[1..]
    }

    #[must_use]
    pub(crate) fn first_segment(&self) -> &str {
        self.relative()
            .split_once('/')
            .map_or(self.relative(), |(first, _)| first)
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
