use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;
use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::header::CONTENT_DISPOSITION;
use reqwest::header::CONTENT_LENGTH;
use reqwest::header::LOCATION;
use url::Url;

use crate::configuration::IngestSettings;
use crate::utils::parse_csv_list;

/// The closed failure set of the outbound-fetch policy. Every variant maps to
/// a stable error code and a client status; nothing else escapes this module.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("only https URLs are accepted")]
    UnsupportedScheme,
    #[error("{0}")]
    ForbiddenAddress(String),
    #[error("too many redirects")]
    RedirectLimit,
    #[error("remote host timed out")]
    RemoteTimeout,
    #[error("payload exceeds the configured size cap")]
    SizeLimit,
    #[error("{0}")]
    Io(String),
}

impl FetchError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnsupportedScheme => "unsupported_scheme",
            Self::ForbiddenAddress(_) => "forbidden_address",
            Self::RedirectLimit => "redirect_limit",
            Self::RemoteTimeout => "remote_timeout",
            Self::SizeLimit => "size_limit",
            Self::Io(_) => "io_error",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::UnsupportedScheme | Self::RedirectLimit | Self::SizeLimit => 400,
            Self::ForbiddenAddress(_) => 403,
            Self::RemoteTimeout => 504,
            Self::Io(_) => 502,
        }
    }
}

pub struct FetchedDocument {
    pub bytes: Vec<u8>,
    pub filename: Option<String>,
}

/// Pulls remote documents under the scheme/host/IP policy: HTTPS only,
/// deny-list beats allow-list, every resolved IP must be public, and every
/// redirect hop is re-validated from scratch. No request headers from the
/// ingress side are ever forwarded.
pub struct RemoteFetcher {
    client: reqwest::Client,
    allow: Vec<String>,
    deny: Vec<String>,
    redirect_limit: u32,
    max_bytes: usize,
}

impl RemoteFetcher {
    pub fn new(settings: &IngestSettings) -> Result<Self, anyhow::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(settings.timeout_connect_ms))
            .timeout(Duration::from_millis(settings.timeout_read_ms))
            // hops are validated manually, one by one
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            client,
            allow: lowercase(parse_csv_list(&settings.url_allowlist)),
            deny: lowercase(parse_csv_list(&settings.url_denylist)),
            redirect_limit: settings.redirect_limit,
            max_bytes: settings.max_upload_bytes(),
        })
    }

    /// Scheme, host policy and DNS/IP classification, without touching the
    /// remote. Rejected URLs never cause an outbound request.
    pub async fn ensure_url_allowed(&self, url: &str) -> Result<Url, FetchError> {
        let parsed = Url::parse(url).map_err(|e| FetchError::Io(format!("malformed URL: {e}")))?;
        if parsed.scheme() != "https" {
            return Err(FetchError::UnsupportedScheme);
        }

        let ips = match parsed.host() {
            None => return Err(FetchError::Io("URL has no host".into())),
            // literal addresses skip both the domain lists and DNS
            Some(url::Host::Ipv4(ip)) => vec![IpAddr::V4(ip)],
            Some(url::Host::Ipv6(ip)) => vec![IpAddr::V6(ip)],
            Some(url::Host::Domain(domain)) => {
                // `Url` has already IDNA-encoded the domain
                let host = domain.to_ascii_lowercase();
                if self.deny.iter().any(|d| host_matches(&host, d)) {
                    return Err(FetchError::ForbiddenAddress("host is denied by policy".into()));
                }
                if !self.allow.is_empty() && !self.allow.iter().any(|d| host_matches(&host, d)) {
                    return Err(FetchError::ForbiddenAddress("host not in allowlist".into()));
                }
                resolve_ips(&host).await?
            }
        };

        for ip in ips {
            if is_forbidden_ip(ip) {
                return Err(FetchError::ForbiddenAddress(
                    "host resolves to a forbidden address".into(),
                ));
            }
        }
        Ok(parsed)
    }

    /// Fetch a remote document under the policy: content-length precheck, a
    /// re-validated redirect chain, and a hard byte cap while streaming.
    pub async fn fetch(&self, url: &str) -> Result<FetchedDocument, FetchError> {
        let mut current = self.ensure_url_allowed(url).await?;
        let mut redirects = 0u32;

        loop {
            // cheap HEAD first: a declared length over the cap never gets a GET
            let head = self
                .client
                .head(current.as_str())
                .send()
                .await
                .map_err(classify_transport_error)?;
            if declared_length_exceeds(head.headers(), self.max_bytes) {
                return Err(FetchError::SizeLimit);
            }

            let resp = self
                .client
                .get(current.as_str())
                .send()
                .await
                .map_err(classify_transport_error)?;

            let status = resp.status().as_u16();
            if is_redirect(status) {
                redirects += 1;
                if redirects > self.redirect_limit {
                    return Err(FetchError::RedirectLimit);
                }
                let location = resp
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| FetchError::Io("redirect without Location".into()))?;
                let next = current
                    .join(location)
                    .map_err(|e| FetchError::Io(format!("bad redirect target: {e}")))?;
                current = self.ensure_url_allowed(next.as_str()).await?;
                continue;
            }
            if status >= 400 {
                return Err(FetchError::Io(format!("remote returned {status}")));
            }

            let filename = filename_from_response(resp.headers(), &current);

            let mut bytes = Vec::new();
            let mut resp = resp;
            while let Some(chunk) = resp.chunk().await.map_err(classify_transport_error)? {
                bytes.extend_from_slice(&chunk);
                if bytes.len() > self.max_bytes {
                    return Err(FetchError::SizeLimit);
                }
            }
            return Ok(FetchedDocument { bytes, filename });
        }
    }
}

fn lowercase(mut items: Vec<String>) -> Vec<String> {
    for item in &mut items {
        *item = item.to_ascii_lowercase();
    }
    items
}

/// Exact match or suffix match on a dot boundary: `docs.example.com` matches
/// `example.com`, `evilexample.com` does not.
pub fn host_matches(host: &str, domain: &str) -> bool {
    host == domain || host.ends_with(&format!(".{domain}"))
}

fn is_redirect(status: u16) -> bool { matches!(status, 301 | 302 | 303 | 307 | 308) }

/// True when the response declares a Content-Length above the cap. Absent or
/// unparsable lengths pass; the streaming cap still applies.
pub fn declared_length_exceeds(headers: &HeaderMap, cap: usize) -> bool {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
        .map(|len| len > cap)
        .unwrap_or(false)
}

fn filename_from_response(headers: &HeaderMap, url: &Url) -> Option<String> {
    if let Some(cd) = headers.get(CONTENT_DISPOSITION).and_then(|v| v.to_str().ok()) {
        if let Some((_, rest)) = cd.split_once("filename=") {
            let name = rest.trim().trim_matches('"').trim();
            if !name.is_empty() {
                return Some(name.to_owned());
            }
        }
    }
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

async fn resolve_ips(host: &str) -> Result<Vec<IpAddr>, FetchError> {
    let addrs: Vec<IpAddr> = tokio::net::lookup_host((host, 443))
        .await
        .map_err(|e| FetchError::Io(format!("DNS resolution failed: {e}")))?
        .map(|sa| sa.ip())
        .collect();
    if addrs.is_empty() {
        return Err(FetchError::Io("DNS resolution returned no addresses".into()));
    }
    Ok(addrs)
}

/// Any address a server-side fetch must never talk to: private, loopback,
/// link-local, multicast, reserved, broadcast or unspecified ranges, for both
/// address families (v4-mapped v6 included).
pub fn is_forbidden_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => forbidden_v4(v4),
        IpAddr::V6(v6) => forbidden_v6(v6),
    }
}

fn forbidden_v4(ip: Ipv4Addr) -> bool {
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_multicast()
        || ip.is_broadcast()
        || ip.is_documentation()
        || ip.is_unspecified()
        // 240.0.0.0/4 reserved block
        || ip.octets()[0] >= 240
}

fn forbidden_v6(ip: Ipv6Addr) -> bool {
    if let Some(mapped) = ip.to_ipv4_mapped() {
        return forbidden_v4(mapped);
    }
    let segments = ip.segments();
    let first = segments[0];
    // everything outside global unicast 2000::/3 is loopback, link-local,
    // unique-local, multicast, discard-only, NAT64 or an IANA-reserved block
    if (first & 0xe000) != 0x2000 {
        return true;
    }
    // special-purpose carve-outs inside 2000::/3
    // 2001::/23 IETF protocol assignments (Teredo, ORCHID, benchmarking)
    (first == 0x2001 && segments[1] < 0x0200)
        // 2001:db8::/32 documentation
        || (first == 0x2001 && segments[1] == 0x0db8)
        // 3fff::/20 documentation
        || (first == 0x3fff && (segments[1] & 0xf000) == 0)
}

fn classify_transport_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::RemoteTimeout
    } else {
        FetchError::Io(format!("transport error: {e}"))
    }
}
