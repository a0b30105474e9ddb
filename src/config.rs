use std::collections::BTreeMap;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;
use std::net::SocketAddr;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr as _;
use std::time::Duration;

use anyhow::Context as _;
use anyhow::anyhow;
use anyhow::bail;
use log::LevelFilter;
use serde::Deserialize;
use serde::Deserializer;

pub(crate) const DEFAULT_CONFIGURATION_PATH: &str = "/etc/remirror/remirror.conf";
pub(crate) const DEFAULT_LISTEN_PORT: u16 = 80;
pub(crate) const DEFAULT_DATA_DIR: &str = "/var/remirror";
pub(crate) const DEFAULT_HOST: &str = "9ex-dc-mirror";
pub(crate) const DEFAULT_UPSTREAM: &str = "https://mirrors.xmission.com";
pub(crate) const DEFAULT_CENTOS_RELEASE_PINS: [(&str, &str); 1] = [("7", "7.2.1511")];
pub(crate) const DEFAULT_EPEL_REWRITE_REPOS: [&str; 1] = ["epel-7"];
pub(crate) const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_FEDORA_MIRRORS_PORT: u16 = 80;
pub(crate) const DEFAULT_DNS_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const DEFAULT_BUF_SIZE: usize = 32 * 1024; // 32 KiB
pub(crate) const DEFAULT_LOG_LEVEL: LevelFilter = LevelFilter::Info;

const DNS_PORT: u16 = 53;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Config {
    /// Minimum log level severity to output.
    /// Can be overridden via program options.
    #[serde(default = "default_log_level", deserialize_with = "from_level_name")]
    pub(crate) log_level: LevelFilter,

    /// HTTP listen address, `:port` listens on all interfaces.
    #[serde(default = "default_listen", deserialize_with = "from_listen_addr")]
    pub(crate) listen: SocketAddr,

    /// DNS server used to reach the real mirror-list hosts.
    #[serde(default = "default_dns", deserialize_with = "from_dns_server")]
    pub(crate) dns: SocketAddr,

    /// Data storage path (data in here is public).
    #[serde(default = "default_data_dir")]
    pub(crate) data: PathBuf,

    /// This hosts name, embedded into the synthesised mirror lists.
    #[serde(default = "default_host")]
    pub(crate) host: String,

    /// Base URL of the archive mirror all distributions are fetched from.
    #[serde(default = "default_upstream")]
    pub(crate) upstream: String,

    /// CentOS releases rewritten to a pinned snapshot.
    #[serde(default = "default_centos_release_pins")]
    pub(crate) centos_release_pins: BTreeMap<String, String>,

    /// EPEL repositories whose metalink gets pointed at this proxy.
    #[serde(default = "default_epel_rewrite_repos")]
    pub(crate) epel_rewrite_repos: Vec<String>,

    /// Timeout for upstream http operations, zero disables it.
    #[serde(default = "default_http_timeout", deserialize_with = "from_secs_f32")]
    pub(crate) http_timeout: Duration,

    /// Plain HTTP port of the real Fedora mirror-list host.
    #[serde(default = "default_fedora_mirrors_port")]
    pub(crate) fedora_mirrors_port: u16,

    /// Timeout for the DNS exchange of the mirror-list resolver.
    #[serde(default = "default_dns_timeout", deserialize_with = "from_secs_f32")]
    pub(crate) dns_timeout: Duration,

    /// Size of buffer used for cache file transfers.
    #[serde(
        default = "default_buffer_size",
        deserialize_with = "from_usize_with_magnitude"
    )]
    pub(crate) buffer_size: usize,
}

/// Settings given on the command line, taking precedence over the file.
#[derive(Debug, Default)]
pub(crate) struct Overrides {
    pub(crate) listen: Option<String>,
    pub(crate) dns: Option<String>,
    pub(crate) data: Option<PathBuf>,
    pub(crate) host: Option<String>,
    pub(crate) upstream: Option<String>,
}

fn from_level_name<'de, D>(deserializer: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;
    let s: String = Deserialize::deserialize(deserializer)?;

    LevelFilter::from_str(&s).map_err(D::Error::custom)
}

fn from_secs_f32<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;
    let s: f32 = Deserialize::deserialize(deserializer)?;

    Duration::try_from_secs_f32(s).map_err(D::Error::custom)
}

fn from_listen_addr<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;
    let s: String = Deserialize::deserialize(deserializer)?;

    parse_listen_addr(&s).map_err(D::Error::custom)
}

fn from_dns_server<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;
    let s: String = Deserialize::deserialize(deserializer)?;

    parse_dns_server(&s).map_err(D::Error::custom)
}

fn from_usize_with_magnitude<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;
    let s: String = Deserialize::deserialize(deserializer)?;

    parse_usize_with_magnitude(&s).map_err(D::Error::custom)
}

/// Parses `:port`, `host:port` and `[v6]:port`.
/// A missing host listens on every interface.
pub(crate) fn parse_listen_addr(s: &str) -> anyhow::Result<SocketAddr> {
    let s = s.trim();

    if let Some(port) = s.strip_prefix(':') {
        let port = port
            .parse::<u16>()
            .with_context(|| format!("Invalid listen port in `{s}`"))?;
        return Ok(SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)));
    }

    s.parse::<SocketAddr>()
        .with_context(|| format!("Invalid listen address `{s}`, expected `[host]:port`"))
}

/// Parses a DNS server address, port 53 is implied when none is given.
pub(crate) fn parse_dns_server(s: &str) -> anyhow::Result<SocketAddr> {
    let s = s.trim();

    if let Ok(ip) = s.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DNS_PORT));
    }

    s.parse::<SocketAddr>()
        .with_context(|| format!("Invalid DNS server `{s}`, expected an IP address"))
}

fn parse_usize_with_magnitude(s: &str) -> anyhow::Result<usize> {
    debug_assert_eq!(s, s.trim(), "Should be trimmed by deserializer");

    if let Ok(val) = s.parse::<usize>() {
        return Ok(val);
    }

    let Some(x) = s.find(|c| !char::is_ascii_digit(&c)) else {
        bail!("Could not split input");
    };

    let (val, mag) = s.split_at(x);

    let val = val.parse::<usize>()?;

    let factor = match mag.trim() {
        "k" => 1000,
        "Ki" => 1024,
        "M" => 1000 * 1000,
        "Mi" => 1024 * 1024,
        "G" => 1000 * 1000 * 1000,
        "Gi" => 1024 * 1024 * 1024,
        mag => bail!("Invalid magnitude `{mag}`, expected `k`, `Ki`, `M`, `Mi`, `G` or `Gi`"),
    };

    val.checked_mul(factor)
        .ok_or_else(|| anyhow!("Multiplication overflow"))
}

const fn default_log_level() -> LevelFilter {
    DEFAULT_LOG_LEVEL
}

const fn default_listen() -> SocketAddr {
    SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), DEFAULT_LISTEN_PORT)
}

const fn default_dns() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), DNS_PORT)
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(DEFAULT_DATA_DIR)
}

fn default_host() -> String {
    DEFAULT_HOST.to_owned()
}

fn default_upstream() -> String {
    DEFAULT_UPSTREAM.to_owned()
}

fn default_centos_release_pins() -> BTreeMap<String, String> {
    DEFAULT_CENTOS_RELEASE_PINS
        .iter()
        .map(|(release, pinned)| ((*release).to_owned(), (*pinned).to_owned()))
        .collect()
}

fn default_epel_rewrite_repos() -> Vec<String> {
    DEFAULT_EPEL_REWRITE_REPOS
        .iter()
        .map(|repo| (*repo).to_owned())
        .collect()
}

const fn default_http_timeout() -> Duration {
    DEFAULT_HTTP_TIMEOUT
}

const fn default_fedora_mirrors_port() -> u16 {
    DEFAULT_FEDORA_MIRRORS_PORT
}

const fn default_dns_timeout() -> Duration {
    DEFAULT_DNS_TIMEOUT
}

const fn default_buffer_size() -> usize {
    DEFAULT_BUF_SIZE
}

#[must_use]
pub(crate) fn is_valid_domain(domain: &str) -> bool {
    /* No unicode characters allowed for now */

    for part in domain.split('.') {
        if part.is_empty() || part.len() > 63 {
            return false;
        }

        for (pos, char) in part.chars().enumerate() {
            if char == '-' {
                if pos == 0 || pos == part.len() - 1 {
                    return false;
                }
            } else if !char.is_ascii_alphanumeric() {
                return false;
            }
        }
    }

    true
}

/// A hostname usable in a URL authority, optionally followed by a port.
#[must_use]
pub(crate) fn is_valid_proxy_host(host: &str) -> bool {
    match host.rsplit_once(':') {
        Some((name, port)) => port.parse::<u16>().is_ok() && is_valid_domain(name),
        None => is_valid_domain(host),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL,
            listen: default_listen(),
            dns: default_dns(),
            data: default_data_dir(),
            host: default_host(),
            upstream: default_upstream(),
            centos_release_pins: default_centos_release_pins(),
            epel_rewrite_repos: default_epel_rewrite_repos(),
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            fedora_mirrors_port: DEFAULT_FEDORA_MIRRORS_PORT,
            dns_timeout: DEFAULT_DNS_TIMEOUT,
            buffer_size: DEFAULT_BUF_SIZE,
        }
    }
}

impl Config {
    /// Loads the configuration file and applies the command line overrides.
    /// The returned flag signals that the default file was absent.
    pub(crate) fn new(file: &Path, overrides: Overrides) -> anyhow::Result<(Self, bool)> {
        let (mut config, fallback) = match std::fs::read_to_string(file) {
            Ok(content) => (
                toml::from_str::<Self>(&content).context("Failed to parse configuration")?,
                false,
            ),
            Err(err)
                if err.kind() == std::io::ErrorKind::NotFound
                    && file == Path::new(DEFAULT_CONFIGURATION_PATH) =>
            {
                (Self::default(), true)
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed to read file `{}`", file.display()));
            }
        };

        config.apply(overrides)?;
        config.validate()?;

        Ok((config, fallback))
    }

    fn apply(&mut self, overrides: Overrides) -> anyhow::Result<()> {
        if let Some(listen) = overrides.listen {
            self.listen = parse_listen_addr(&listen)?;
        }
        if let Some(dns) = overrides.dns {
            self.dns = parse_dns_server(&dns)?;
        }
        if let Some(data) = overrides.data {
            self.data = data;
        }
        if let Some(host) = overrides.host {
            self.host = host;
        }
        if let Some(upstream) = overrides.upstream {
            self.upstream = upstream;
        }

        Ok(())
    }

    pub(crate) fn validate(&mut self) -> anyhow::Result<()> {
        if !is_valid_proxy_host(&self.host) {
            bail!("Invalid host `{}`: must be a hostname with optional port", self.host);
        }

        if !self.data.is_absolute() {
            bail!(
                "Invalid data directory `{}`: must be an absolute path",
                self.data.display()
            );
        }

        {
            let trimmed = self.upstream.trim_end_matches('/');
            let uri = trimmed
                .parse::<hyper::Uri>()
                .with_context(|| format!("Invalid upstream `{}`", self.upstream))?;

            if !matches!(uri.scheme_str(), Some("http" | "https")) {
                bail!("Invalid upstream `{}`: scheme must be http or https", self.upstream);
            }
            if uri.authority().is_none() {
                bail!("Invalid upstream `{}`: host is missing", self.upstream);
            }
            if uri.query().is_some() {
                bail!("Invalid upstream `{}`: query is not permitted", self.upstream);
            }

            self.upstream = trimmed.to_owned();
        }

        if let Some(repo) = self
            .epel_rewrite_repos
            .iter()
            .find(|repo| repo.strip_prefix("epel-").is_none_or(str::is_empty))
        {
            bail!("Invalid EPEL repository `{repo}`: expected `epel-<release>`");
        }

        if self.fedora_mirrors_port == 0 {
            bail!("Invalid fedora_mirrors_port value of 0");
        }

        if self.dns_timeout.is_zero() || self.dns_timeout > Duration::from_secs(60) {
            bail!(
                "Invalid dns_timeout value of {}: must be in between 0s and 60s",
                self.dns_timeout.as_secs_f32()
            );
        }

        if self.http_timeout > Duration::from_secs(6 * 60) {
            bail!(
                "Invalid http_timeout value of {}: must be less or equal to 360s",
                self.http_timeout.as_secs_f32()
            );
        }

        if self.buffer_size < 1024 || self.buffer_size > 1024 * 1024 * 1024 {
            bail!(
                "Invalid buffer_size value of {}: must be in between 1K and 1G",
                self.buffer_size
            );
        }

        Ok(())
    }
}
