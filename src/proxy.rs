//! Proxy configuration and routing.
//!
//! A [`ProxyConfig`] describes one upstream HTTP proxy: its `(host, port)`, optional Basic
//! credentials, and a [`NoProxy`] exclusion list. [`ProxyConfig::from_env`] reads the
//! conventional `http_proxy`/`no_proxy` environment variables the way curl and every HTTP
//! client in this ecosystem does.
//!
//! The routing rule (§4.1 of the specification) is: a `Call`'s effective target is the proxy
//! if one is configured and the request URI's host is not excluded by `no_proxy`; otherwise the
//! origin server. Proxied calls are serialized with an absolute-form request URI; direct calls
//! use origin-form.

use std::{env, net::IpAddr};

use base64::Engine;
use http::{Uri, header::HeaderValue};
use ipnet::IpNet;

/// An HTTP proxy a `Pipeline` may route calls through.
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    host: String,
    port: u16,
    auth: Option<HeaderValue>,
    no_proxy: NoProxy,
}

impl ProxyConfig {
    /// Create a proxy configuration pointing at `host:port` with no credentials and an empty
    /// `no_proxy` list.
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        ProxyConfig {
            host: host.into(),
            port,
            auth: None,
            no_proxy: NoProxy::default(),
        }
    }

    /// Attach Basic credentials, sent as `Proxy-Authorization` on every proxied request.
    pub fn with_basic_auth(mut self, username: &str, password: &str) -> Self {
        self.auth = Some(basic_auth_header(username, password));
        self
    }

    /// Set the `no_proxy` exclusion list (comma-separated hostnames and `.suffix` patterns).
    pub fn with_no_proxy(mut self, no_proxy: &str) -> Self {
        self.no_proxy = NoProxy::parse(no_proxy);
        self
    }

    /// Build a proxy configuration from `http_proxy`/`HTTP_PROXY` and `no_proxy`/`NO_PROXY`.
    /// Returns `None` if no proxy variable is set.
    pub fn from_env() -> Option<Self> {
        let raw = env::var("http_proxy")
            .or_else(|_| env::var("HTTP_PROXY"))
            .ok()?;
        let uri: Uri = raw.parse().ok()?;
        let host = uri.host()?.to_owned();
        let port = uri.port_u16().unwrap_or(8080);

        let mut cfg = ProxyConfig::new(host, port);

        if let Some(authority) = uri.authority() {
            if let Some((userinfo, _)) = authority.as_str().rsplit_once('@') {
                if let Some((user, pass)) = userinfo.split_once(':') {
                    cfg = cfg.with_basic_auth(user, pass);
                }
            }
        }

        let no_proxy = env::var("no_proxy").or_else(|_| env::var("NO_PROXY")).ok();
        if let Some(no_proxy) = no_proxy {
            cfg = cfg.with_no_proxy(&no_proxy);
        }

        Some(cfg)
    }

    /// The proxy's host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The proxy's port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The pre-encoded `Proxy-Authorization` header value, if credentials were configured.
    pub(crate) fn auth_header(&self) -> Option<&HeaderValue> {
        self.auth.as_ref()
    }

    /// Returns true if `uri`'s host should bypass this proxy per the `no_proxy` list.
    pub fn is_excluded(&self, uri: &Uri) -> bool {
        self.no_proxy.matches(uri)
    }
}

pub(crate) fn basic_auth_header(username: &str, password: &str) -> HeaderValue {
    let credentials = base64::engine::general_purpose::STANDARD
        .encode(format!("{username}:{password}"));
    let mut value = HeaderValue::from_str(&format!("Basic {credentials}"))
        .expect("base64-encoded credentials are valid header bytes");
    value.set_sensitive(true);
    value
}

/// A filter of hostnames and IP ranges excluded from proxying, modeled on curl's `NO_PROXY`
/// semantics: an exact label match, a `.suffix` match, or a bare CIDR/IP match.
#[derive(Clone, Debug, Default)]
struct NoProxy {
    domains: Vec<String>,
    ips: Vec<IpEntry>,
}

#[derive(Clone, Debug)]
enum IpEntry {
    Address(IpAddr),
    Network(IpNet),
}

impl NoProxy {
    fn parse(raw: &str) -> Self {
        let mut domains = Vec::new();
        let mut ips = Vec::new();
        for part in raw.split(',') {
            let part = part.trim();
            if part.is_empty() || part == "*" {
                if part == "*" {
                    domains.push("*".to_owned());
                }
                continue;
            }
            if let Ok(net) = part.parse::<IpNet>() {
                ips.push(IpEntry::Network(net));
            } else if let Ok(addr) = part.parse::<IpAddr>() {
                ips.push(IpEntry::Address(addr));
            } else {
                domains.push(part.to_ascii_lowercase());
            }
        }
        NoProxy { domains, ips }
    }

    fn matches(&self, uri: &Uri) -> bool {
        let Some(host) = uri.host() else {
            return false;
        };
        if let Ok(addr) = host.parse::<IpAddr>() {
            return self.ips.iter().any(|ip| match ip {
                IpEntry::Address(a) => *a == addr,
                IpEntry::Network(net) => net.contains(&addr),
            });
        }
        self.domain_matches(host)
    }

    // See https://curl.se/libcurl/c/CURLOPT_NOPROXY.html and
    // https://github.com/curl/curl/issues/1208 for the origin of these rules: an entry matches
    // either the whole host, or any subdomain of it, but never an unrelated host that merely
    // ends with the same characters (e.g. `example.com` must not match `notexample.com`).
    fn domain_matches(&self, host: &str) -> bool {
        let host_len = host.len();
        for d in &self.domains {
            if d == "*" {
                return true;
            }
            if d == host || d.strip_prefix('.') == Some(host) {
                return true;
            }
            if host.ends_with(d.as_str()) {
                if d.starts_with('.') {
                    return true;
                }
                if host.as_bytes().get(host_len - d.len() - 1) == Some(&b'.') {
                    return true;
                }
            }
        }
        false
    }
}
