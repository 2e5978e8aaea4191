//! Swift HTTP client
//!
//! Minimal TempAuth (v1.0) client: one GET against the auth URL yields the
//! storage URL and token used for all container and object requests. The
//! token is cached and refreshed once on a 401.

use reqwest::blocking::{Client, RequestBuilder, Response};
use std::sync::Mutex;
use std::time::Duration;

use super::{Headers, ObjectStore, StoreError, StoreResult};

const AUTH_TOKEN_HEADER: &str = "x-auth-token";

#[derive(Clone)]
struct AuthState {
    storage_url: String,
    token: String,
}

/// Client for one account on a Swift-compatible store.
pub struct SwiftClient {
    http: Client,
    authurl: String,
    username: String,
    password: String,
    auth: Mutex<Option<AuthState>>,
}

impl SwiftClient {
    pub fn new(authurl: &str, username: &str, password: &str) -> StoreResult<Self> {
        // No request timeout: an object store call may legitimately block
        // for a long time and the NBD client decides when to give up.
        let http = Client::builder()
            .timeout(None::<Duration>)
            .build()
            .map_err(|err| StoreError::Transport(err.to_string()))?;

        Ok(Self {
            http,
            authurl: authurl.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            auth: Mutex::new(None),
        })
    }

    fn authenticate(&self) -> StoreResult<AuthState> {
        log::debug!("authenticating against {}", self.authurl);

        let resp = self
            .http
            .get(&self.authurl)
            .header("x-auth-user", self.username.as_str())
            .header("x-auth-key", self.password.as_str())
            .send()?;

        if !resp.status().is_success() {
            return Err(StoreError::Auth(format!(
                "status {}",
                resp.status().as_u16()
            )));
        }

        let header = |name: &str| -> StoreResult<String> {
            resp.headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
                .ok_or_else(|| StoreError::Auth(format!("missing {} header", name)))
        };

        Ok(AuthState {
            storage_url: header("x-storage-url")?,
            token: header(AUTH_TOKEN_HEADER)?,
        })
    }

    fn auth_state(&self) -> StoreResult<AuthState> {
        let mut auth = self.auth.lock().unwrap();
        if let Some(state) = auth.as_ref() {
            return Ok(state.clone());
        }
        let state = self.authenticate()?;
        *auth = Some(state.clone());
        Ok(state)
    }

    /// Send a request, re-authenticating once if the token has expired.
    fn execute<F>(&self, build: F) -> StoreResult<Response>
    where
        F: Fn(&Client, &AuthState) -> RequestBuilder,
    {
        let mut state = self.auth_state()?;
        for retried in [false, true] {
            let resp = build(&self.http, &state)
                .header(AUTH_TOKEN_HEADER, state.token.as_str())
                .send()?;

            match resp.status().as_u16() {
                401 if !retried => {
                    log::debug!("token rejected, re-authenticating");
                    *self.auth.lock().unwrap() = None;
                    state = self.auth_state()?;
                }
                404 => return Err(StoreError::NotFound),
                _ if resp.status().is_success() => return Ok(resp),
                status => return Err(StoreError::Status(status)),
            }
        }
        Err(StoreError::Auth(
            "token rejected after re-authentication".to_string(),
        ))
    }
}

impl ObjectStore for SwiftClient {
    fn get_container(
        &self,
        container: &str,
        limit: Option<usize>,
        marker: Option<&str>,
    ) -> StoreResult<(Headers, Vec<String>)> {
        let resp = self.execute(|http, state| {
            let mut req = http.get(format!("{}/{}", state.storage_url, container));
            if let Some(limit) = limit {
                req = req.query(&[("limit", limit.to_string())]);
            }
            if let Some(marker) = marker {
                req = req.query(&[("marker", marker)]);
            }
            req
        })?;

        let headers = header_map(&resp);
        let body = resp.text()?;
        let names = body
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        Ok((headers, names))
    }

    fn put_container(&self, container: &str, headers: &Headers) -> StoreResult<()> {
        self.execute(|http, state| {
            let mut req = http.put(format!("{}/{}", state.storage_url, container));
            for (name, value) in headers {
                req = req.header(name.as_str(), value.as_str());
            }
            req
        })?;
        Ok(())
    }

    fn get_object(&self, container: &str, name: &str) -> StoreResult<Vec<u8>> {
        let resp = self.execute(|http, state| {
            http.get(format!("{}/{}/{}", state.storage_url, container, name))
        })?;
        Ok(resp.bytes()?.to_vec())
    }

    fn put_object(&self, container: &str, name: &str, data: &[u8]) -> StoreResult<String> {
        let resp = self.execute(|http, state| {
            http.put(format!("{}/{}/{}", state.storage_url, container, name))
                .body(data.to_vec())
        })?;

        resp.headers()
            .get("etag")
            .and_then(|value| value.to_str().ok())
            .map(|etag| etag.trim_matches('"').to_ascii_lowercase())
            .ok_or_else(|| StoreError::Transport("no etag in response".to_string()))
    }

    fn delete_object(&self, container: &str, name: &str) -> StoreResult<()> {
        self.execute(|http, state| {
            http.delete(format!("{}/{}/{}", state.storage_url, container, name))
        })?;
        Ok(())
    }

    fn delete_container(&self, container: &str) -> StoreResult<()> {
        self.execute(|http, state| http.delete(format!("{}/{}", state.storage_url, container)))?;
        Ok(())
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        StoreError::Transport(err.to_string())
    }
}

fn header_map(resp: &Response) -> Headers {
    resp.headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_ascii_lowercase(), value.to_string()))
        })
        .collect()
}
