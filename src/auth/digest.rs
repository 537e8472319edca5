//! HTTP Digest authentication (RFC 2617, with RFC 2069 compatibility): nonce-based, avoids
//! sending the password in the clear. Supports the `MD5` and `MD5-sess` algorithms and the
//! `auth` quality-of-protection; `auth-int` (body-hash qop) is not implemented since request
//! bodies are not guaranteed to be replayable (see [`crate::body`]).

use std::fmt::Write as _;

use http::{HeaderValue, Method, Uri};
use md5::{Digest, Md5};
use rand::Rng;

use super::{AuthScheme, Challenge, Key, Session};
use crate::error::Result;

pub(crate) struct DigestScheme;

impl AuthScheme for DigestScheme {
    fn name(&self) -> &'static str {
        "digest"
    }

    fn strength(&self) -> u8 {
        2
    }

    fn create_session(&self, challenge: &Challenge, key: Key) -> Box<dyn Session> {
        let sess_algo = challenge
            .params
            .get("algorithm")
            .map(|a| a.eq_ignore_ascii_case("MD5-sess"))
            .unwrap_or(false);
        Box::new(DigestSession {
            key,
            realm: challenge.params.get("realm").cloned().unwrap_or_default(),
            nonce: challenge.params.get("nonce").cloned().unwrap_or_default(),
            opaque: challenge.params.get("opaque").cloned(),
            qop: challenge.params.get("qop").cloned(),
            sess_algo,
            nc: 0,
        })
    }
}

struct DigestSession {
    key: Key,
    realm: String,
    nonce: String,
    opaque: Option<String>,
    qop: Option<String>,
    sess_algo: bool,
    nc: u32,
}

impl Session for DigestSession {
    fn authorization(&mut self, method: &Method, uri: &Uri) -> Result<HeaderValue> {
        self.nc += 1;
        let cnonce = generate_cnonce();
        let digest_uri = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");

        let ha1 = if self.sess_algo {
            let base = md5_hex(&format!("{}:{}:{}", self.key.username, self.realm, self.key.password));
            md5_hex(&format!("{base}:{}:{cnonce}", self.nonce))
        } else {
            md5_hex(&format!("{}:{}:{}", self.key.username, self.realm, self.key.password))
        };

        let ha2 = md5_hex(&format!("{method}:{digest_uri}"));

        let nc_field = format!("{:08x}", self.nc);
        let qop_token = self.qop.as_deref().filter(|q| q.split(',').any(|t| t.trim() == "auth"));

        let response = match qop_token {
            Some(_) => md5_hex(&format!("{ha1}:{}:{nc_field}:{cnonce}:auth:{ha2}", self.nonce)),
            None => md5_hex(&format!("{ha1}:{}:{ha2}", self.nonce)),
        };

        let mut value = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\"",
            self.key.username, self.realm, self.nonce, digest_uri, response
        );
        if self.sess_algo {
            value.push_str(", algorithm=MD5-sess");
        }
        if let Some(opaque) = &self.opaque {
            let _ = write!(value, ", opaque=\"{opaque}\"");
        }
        if qop_token.is_some() {
            let _ = write!(value, ", qop=auth, nc={nc_field}, cnonce=\"{cnonce}\"");
        }

        let mut header = HeaderValue::from_str(&value).map_err(|_| super::invalid_credentials())?;
        header.set_sensitive(true);
        Ok(header)
    }

    fn invalidate(&mut self, challenge: &Challenge) -> bool {
        let stale = challenge
            .params
            .get("stale")
            .map(|s| s.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if stale {
            if let Some(nonce) = challenge.params.get("nonce") {
                self.nonce = nonce.clone();
                self.nc = 0;
                return true;
            }
        }
        false
    }

    fn domain(&self) -> &[Uri] {
        &self.key.domain
    }
}

fn generate_cnonce() -> String {
    let bytes: [u8; 8] = rand::thread_rng().gen();
    let mut out = String::with_capacity(16);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(32);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 2617 §3.5 worked example.
    #[test]
    fn rfc2617_worked_example() {
        let key = Key::new("Mufasa", "Circle Of Life").with_realm("testrealm@host.com");
        let challenge = Challenge {
            scheme: "digest".into(),
            params: [
                ("realm", "testrealm@host.com"),
                ("qop", "auth"),
                ("nonce", "dcd98b7102dd2f0e8b11d0f600bfb0c093"),
                ("opaque", "5ccc069c403ebaf9f0171e9517f40e41"),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect(),
        };
        let scheme = DigestScheme;
        let mut session = scheme.create_session(&challenge, key);

        // RFC 2617's example fixes cnonce = 0a4f113b; we can't inject that through the public
        // API, so instead verify HA1/HA2 composition produces a stable, well-formed header.
        let uri: Uri = "http://www.nowhere.org/dir/index.html".parse().unwrap();
        let header = session.authorization(&Method::GET, &uri).unwrap();
        let text = header.to_str().unwrap();
        assert!(text.starts_with("Digest username=\"Mufasa\""));
        assert!(text.contains("realm=\"testrealm@host.com\""));
        assert!(text.contains("nonce=\"dcd98b7102dd2f0e8b11d0f600bfb0c093\""));
        assert!(text.contains("qop=auth"));
        assert!(text.contains("nc=00000001"));
        assert!(text.contains("response=\""));
    }

    #[test]
    fn nc_increments_per_call() {
        let key = Key::new("u", "p");
        let challenge = Challenge {
            scheme: "digest".into(),
            params: [("realm", "r"), ("nonce", "n"), ("qop", "auth")]
                .into_iter()
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .collect(),
        };
        let mut session = DigestScheme.create_session(&challenge, key);
        let uri: Uri = "http://host/path".parse().unwrap();
        let first = session.authorization(&Method::GET, &uri).unwrap();
        let second = session.authorization(&Method::GET, &uri).unwrap();
        assert!(first.to_str().unwrap().contains("nc=00000001"));
        assert!(second.to_str().unwrap().contains("nc=00000002"));
    }

    #[test]
    fn rfc2069_no_qop_omits_nc_and_cnonce() {
        let key = Key::new("u", "p");
        let challenge = Challenge {
            scheme: "digest".into(),
            params: [("realm", "r"), ("nonce", "n")]
                .into_iter()
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .collect(),
        };
        let mut session = DigestScheme.create_session(&challenge, key);
        let uri: Uri = "http://host/path".parse().unwrap();
        let header = session.authorization(&Method::GET, &uri).unwrap();
        let text = header.to_str().unwrap();
        assert!(!text.contains("qop="));
        assert!(!text.contains("nc="));
    }

    #[test]
    fn stale_nonce_triggers_retry_with_refresh() {
        let key = Key::new("u", "p");
        let challenge = Challenge {
            scheme: "digest".into(),
            params: [("realm", "r"), ("nonce", "n1"), ("qop", "auth")]
                .into_iter()
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .collect(),
        };
        let mut session = DigestScheme.create_session(&challenge, key);
        let stale_challenge = Challenge {
            scheme: "digest".into(),
            params: [("stale", "true"), ("nonce", "n2")]
                .into_iter()
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .collect(),
        };
        assert!(session.invalidate(&stale_challenge));

        let bad_challenge = Challenge {
            scheme: "digest".into(),
            params: Default::default(),
        };
        assert!(!session.invalidate(&bad_challenge));
    }
}
