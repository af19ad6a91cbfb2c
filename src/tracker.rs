//! Cookie-backed session tracking
//!
//! Hands out opaque per-client identifiers carried in a cookie. The
//! identifier never reaches upstream servers: the anomaly middleware strips
//! the cookie from the request before forwarding.

use hyper::header::{HeaderValue, COOKIE, SET_COOKIE};
use hyper::HeaderMap;
use rand::RngCore;

/// Issues and reads opaque tracking identifiers stored in a cookie.
#[derive(Debug, Clone)]
pub struct CookieTracker {
    cookie_name: String,
    max_age: u32,
    secure: bool,
}

impl CookieTracker {
    pub fn new(cookie_name: impl Into<String>, max_age: u32, secure: bool) -> Self {
        Self {
            cookie_name: cookie_name.into(),
            max_age,
            secure,
        }
    }

    /// Read the tracker id from the request headers, if present.
    pub fn get(&self, headers: &HeaderMap) -> Option<String> {
        for value in headers.get_all(COOKIE) {
            let raw = match value.to_str() {
                Ok(raw) => raw,
                Err(_) => continue,
            };
            for pair in raw.split(';') {
                let pair = pair.trim();
                if let Some((name, val)) = pair.split_once('=') {
                    if name == self.cookie_name {
                        return Some(val.to_string());
                    }
                }
            }
        }
        None
    }

    /// Generate a fresh tracker id: 16 random bytes, hex encoded.
    pub fn mint(&self) -> String {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Attach a `Set-Cookie` header carrying `id` to the response headers
    /// and return the id.
    pub fn set(&self, headers: &mut HeaderMap, id: &str) -> String {
        let mut cookie = format!(
            "{}={}; Path=/; Max-Age={}; HttpOnly; SameSite=Lax",
            self.cookie_name, id, self.max_age
        );
        if self.secure {
            cookie.push_str("; Secure");
        }

        if let Ok(value) = HeaderValue::from_str(&cookie) {
            headers.append(SET_COOKIE, value);
        }

        id.to_string()
    }

    /// Remove the tracker cookie from the request headers, keeping every
    /// other cookie intact.
    pub fn remove(&self, headers: &mut HeaderMap) {
        let mut kept: Vec<String> = Vec::new();
        for value in headers.get_all(COOKIE) {
            if let Ok(raw) = value.to_str() {
                for pair in raw.split(';') {
                    let pair = pair.trim();
                    if pair.is_empty() {
                        continue;
                    }
                    match pair.split_once('=') {
                        Some((name, _)) if name == self.cookie_name => {}
                        _ => kept.push(pair.to_string()),
                    }
                }
            }
        }

        headers.remove(COOKIE);
        if !kept.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&kept.join("; ")) {
                headers.insert(COOKIE, value);
            }
        }
    }
}
