//! Small `Uri` extension helpers shared across the engine.

use http::uri::{Authority, PathAndQuery, Scheme, Uri};

use crate::error::{Error, Result};

/// Extension trait for `Uri` helpers used by redirect resolution, routing and proxy matching.
pub(crate) trait UriExt {
    /// Returns true if the URI scheme is `http`.
    fn is_http(&self) -> bool;

    /// Returns true if the URI scheme is `https`.
    fn is_https(&self) -> bool;

    /// Returns the port of the URI, or the conventional port for its scheme if unspecified.
    fn port_or_default(&self) -> u16;

    /// Resolves `location` (absolute or relative) against `self`, as the base of a redirect.
    fn resolve(&self, location: &str) -> Result<Uri>;
}

impl UriExt for Uri {
    #[inline]
    fn is_http(&self) -> bool {
        self.scheme() == Some(&Scheme::HTTP)
    }

    #[inline]
    fn is_https(&self) -> bool {
        self.scheme() == Some(&Scheme::HTTPS)
    }

    fn port_or_default(&self) -> u16 {
        match Uri::port(self) {
            Some(p) => p.as_u16(),
            None if self.is_https() => 443,
            _ => 80,
        }
    }

    fn resolve(&self, location: &str) -> Result<Uri> {
        // A `Location` that already parses as absolute wins outright.
        if let Ok(uri) = location.parse::<Uri>() {
            if uri.scheme().is_some() && uri.authority().is_some() {
                return Ok(uri);
            }
        }

        let mut parts = self.clone().into_parts();

        if location.starts_with("//") {
            // protocol-relative: `//host/path`
            let rest = &location[2..];
            let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
            parts.authority = Some(
                authority
                    .parse::<Authority>()
                    .map_err(|_| Error::url_syntax_error(location))?,
            );
            parts.path_and_query = Some(
                format!("/{path}")
                    .parse::<PathAndQuery>()
                    .map_err(|_| Error::url_syntax_error(location))?,
            );
        } else if location.starts_with('/') {
            parts.path_and_query = Some(
                location
                    .parse::<PathAndQuery>()
                    .map_err(|_| Error::url_syntax_error(location))?,
            );
        } else {
            // relative to the current path's directory
            let base_path = self.path();
            let dir = &base_path[..base_path.rfind('/').map(|i| i + 1).unwrap_or(0)];
            let joined = format!("{dir}{location}");
            let normalized = normalize_path(&joined);
            parts.path_and_query = Some(
                normalized
                    .parse::<PathAndQuery>()
                    .map_err(|_| Error::url_syntax_error(location))?,
            );
        }

        Uri::from_parts(parts).map_err(|_| Error::url_syntax_error(location))
    }
}

/// Collapses `.` and `..` segments the way a browser resolving a relative URL would.
fn normalize_path(path: &str) -> String {
    let (path, query) = path.split_once('?').unwrap_or((path, ""));
    let mut segments: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            seg => segments.push(seg),
        }
    }
    let mut out = String::from("/");
    out.push_str(&segments.join("/"));
    if !query.is_empty() {
        out.push('?');
        out.push_str(query);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_or_default_http() {
        let uri: Uri = "http://example.com/x".parse().unwrap();
        assert_eq!(uri.port_or_default(), 80);
    }

    #[test]
    fn port_or_default_https() {
        let uri: Uri = "https://example.com/x".parse().unwrap();
        assert_eq!(uri.port_or_default(), 443);
    }

    #[test]
    fn resolve_absolute_location() {
        let base: Uri = "http://a.example/1".parse().unwrap();
        let next = base.resolve("http://b.example/2").unwrap();
        assert_eq!(next, "http://b.example/2".parse::<Uri>().unwrap());
    }

    #[test]
    fn resolve_absolute_path() {
        let base: Uri = "http://a.example/old/path".parse().unwrap();
        let next = base.resolve("/new/path").unwrap();
        assert_eq!(next, "http://a.example/new/path".parse::<Uri>().unwrap());
    }

    #[test]
    fn resolve_relative_path() {
        let base: Uri = "http://a.example/dir/old".parse().unwrap();
        let next = base.resolve("new").unwrap();
        assert_eq!(next, "http://a.example/dir/new".parse::<Uri>().unwrap());
    }

    #[test]
    fn resolve_dot_dot() {
        let base: Uri = "http://a.example/dir/sub/old".parse().unwrap();
        let next = base.resolve("../new").unwrap();
        assert_eq!(next, "http://a.example/dir/new".parse::<Uri>().unwrap());
    }

    #[test]
    fn resolve_protocol_relative() {
        let base: Uri = "https://a.example/old".parse().unwrap();
        let next = base.resolve("//b.example/new").unwrap();
        assert_eq!(next, "https://b.example/new".parse::<Uri>().unwrap());
    }
}
