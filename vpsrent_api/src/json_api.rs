use crate::retry::{OpError, OpResult};
use crate::{op_fatal, op_transient};
use anyhow::{Result, anyhow};
use log::debug;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, USER_AGENT};
use reqwest::{Client, Method, Request, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::error::Error;
use std::time::Duration;

/// Thin JSON-over-HTTP client shared by the hypervisor adapter and the
/// payment gateway drivers. One instance per remote endpoint; safe to share
/// across tasks.
#[derive(Clone)]
pub struct JsonApi {
    client: Client,
    base: Url,
}

impl JsonApi {
    pub fn new(base: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, "vpsrent/1.0".parse()?);
        headers.insert(ACCEPT, "application/json; charset=utf-8".parse()?);

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base: base.parse()?,
        })
    }

    /// Client with a static Authorization header. `allow_invalid_certs` is
    /// driven by the cluster record, self-signed hypervisors are the norm.
    pub fn token(base: &str, token: &str, allow_invalid_certs: bool) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, "vpsrent/1.0".parse()?);
        headers.insert(AUTHORIZATION, token.parse()?);
        headers.insert(ACCEPT, "application/json; charset=utf-8".parse()?);

        let client = Client::builder()
            .danger_accept_invalid_certs(allow_invalid_certs)
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base: base.parse()?,
        })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> OpResult<T> {
        self.req::<T, ()>(Method::GET, path, None).await
    }

    pub async fn post<T: DeserializeOwned, R: Serialize>(
        &self,
        path: &str,
        body: R,
    ) -> OpResult<T> {
        self.req(Method::POST, path, Some(body)).await
    }

    pub async fn put<T: DeserializeOwned, R: Serialize>(&self, path: &str, body: R) -> OpResult<T> {
        self.req(Method::PUT, path, Some(body)).await
    }

    fn build_req(
        &self,
        method: Method,
        path: &str,
        body: Option<impl Serialize>,
    ) -> Result<Request> {
        let url = self.base.join(path)?;
        let req = self.client.request(method.clone(), url);
        let req = if let Some(body) = body {
            let body = serde_json::to_string(&body)?;
            debug!(">> {} {}: {}", method, path, &body);
            req.header(CONTENT_TYPE, "application/json; charset=utf-8")
                .body(body)
                .build()?
        } else {
            debug!(">> {} {}", method, path);
            req.build()?
        };
        Ok(req)
    }

    pub async fn req<T: DeserializeOwned, R: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<R>,
    ) -> OpResult<T> {
        let req = self
            .build_req(method.clone(), path, body)
            .map_err(OpError::Fatal)?;
        let rsp = match self.client.execute(req).await {
            Ok(rsp) => rsp,
            Err(e) => {
                op_transient!(
                    "Failed to send request: {} source={}",
                    e,
                    e.source()
                        .map(|x| x.to_string())
                        .unwrap_or_else(|| "None".to_owned())
                );
            }
        };

        let status = rsp.status();
        let text = rsp.text().await.map_err(|e| OpError::Fatal(anyhow!(e)))?;
        #[cfg(debug_assertions)]
        debug!("<< {}", text);
        if status.is_success() {
            match serde_json::from_str(&text) {
                Ok(t) => Ok(t),
                Err(e) => {
                    op_fatal!("Failed to parse JSON from {}: {} {}", path, text, e);
                }
            }
        } else if status.is_server_error() {
            op_transient!("{} {}: {}: {}", method, path, status, &text);
        } else {
            // 4xx means the request itself is wrong, retrying won't help
            op_fatal!("{} {}: {}: {}", method, path, status, &text);
        }
    }

    /// Make a request and only return the status code
    pub async fn req_status<R: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<R>,
    ) -> OpResult<u16> {
        let req = self
            .build_req(method.clone(), path, body)
            .map_err(OpError::Fatal)?;
        let rsp = self
            .client
            .execute(req)
            .await
            .map_err(|e| OpError::Transient(anyhow!(e)))?;

        let status = rsp.status();
        if status.is_success() {
            Ok(status.as_u16())
        } else if status.is_server_error() {
            op_transient!("{} {}: {}", method, path, status);
        } else {
            op_fatal!("{} {}: {}", method, path, status);
        }
    }
}
