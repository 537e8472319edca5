//! HTTP Basic authentication (RFC 7617): a single round-trip, stateless beyond the credential
//! itself — the same header is valid for every request in the protection space until the
//! credential is rejected.

use base64::Engine;
use http::{HeaderValue, Method, Uri};

use super::{AuthScheme, Challenge, Key, Session};
use crate::error::Result;

pub(crate) struct BasicScheme;

impl AuthScheme for BasicScheme {
    fn name(&self) -> &'static str {
        "basic"
    }

    fn strength(&self) -> u8 {
        1
    }

    fn create_session(&self, _challenge: &Challenge, key: Key) -> Box<dyn Session> {
        Box::new(BasicSession { key })
    }
}

struct BasicSession {
    key: Key,
}

impl Session for BasicSession {
    fn authorization(&mut self, _method: &Method, _uri: &Uri) -> Result<HeaderValue> {
        let credentials =
            base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", self.key.username, self.key.password));
        let mut value = HeaderValue::from_str(&format!("Basic {credentials}")).map_err(|_| super::invalid_credentials())?;
        value.set_sensitive(true);
        Ok(value)
    }

    fn invalidate(&mut self, _challenge: &Challenge) -> bool {
        // Basic carries no nonce to refresh; a second 401 means the credential itself is wrong.
        false
    }

    fn domain(&self) -> &[Uri] {
        &self.key.domain
    }
}
