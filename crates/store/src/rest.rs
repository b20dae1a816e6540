//! REST backend: the journey store behind a resource API with `journeys`,
//! `steps` and `states` collections.

use std::thread;
use std::time::Duration;

use reqwest::blocking::{Client as HttpTransport, Response};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, warn};
use waypoint_core::config::HttpConfig;
use waypoint_core::{Journey, StateRecord, StateUpdate, StepRecord, StepUpdate, StepWrite};

use crate::client::Client;
use crate::error::{ClientError, StoreError, StoreResult};

/// Blocking JSON API wrapper with optional basic auth and a single,
/// fixed-delay retry on connection failures.
pub struct HttpApi {
    http: HttpTransport,
    base_url: String,
    credentials: Option<(String, Option<String>)>,
    retry: bool,
    retry_delay: Duration,
}

impl HttpApi {
    pub fn new(config: &HttpConfig) -> StoreResult<Self> {
        let http = HttpTransport::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ClientError::new(config.base_url.clone(), Some(e.to_string()), None))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            credentials: config
                .username
                .clone()
                .map(|user| (user, config.password.clone())),
            retry: config.retry,
            retry_delay: Duration::from_secs(config.retry_delay_secs),
        })
    }

    /// `{base_url}/{path}/`
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}/", self.base_url, path.trim_matches('/'))
    }

    pub fn get(&self, path: &str, params: &[(&str, String)]) -> StoreResult<Value> {
        self.send(Method::GET, path, params, None)
    }

    pub fn post(&self, path: &str, body: &Value) -> StoreResult<Value> {
        self.send(Method::POST, path, &[], Some(body))
    }

    pub fn put(&self, path: &str, body: &Value) -> StoreResult<Value> {
        self.send(Method::PUT, path, &[], Some(body))
    }

    pub fn patch(&self, path: &str, body: &Value) -> StoreResult<Value> {
        self.send(Method::PATCH, path, &[], Some(body))
    }

    /// Query a collection expecting at most one match.
    pub fn retrieve_single<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> StoreResult<Option<T>> {
        let mut items: Vec<T> = self.list(path, params)?;
        match items.len() {
            0 => Ok(None),
            1 => Ok(items.pop()),
            n => Err(StoreError::Lookup(format!(
                "expected one item from {} but found {n}",
                self.url(path)
            ))),
        }
    }

    /// Query a collection. Accepts a bare array or a paginated `{"results": [...]}`.
    pub fn list<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> StoreResult<Vec<T>> {
        let body = match self.get(path, params)? {
            Value::Object(mut page) => page.remove("results").unwrap_or(Value::Array(Vec::new())),
            other => other,
        };
        Ok(serde_json::from_value(body)?)
    }

    fn send(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
        body: Option<&Value>,
    ) -> StoreResult<Value> {
        let url = self.url(path);
        let mut retried = false;
        loop {
            let mut request = self.http.request(method.clone(), &url).query(params);
            if let Some(body) = body {
                request = request.json(body);
            }
            if let Some((user, password)) = &self.credentials {
                request = request.basic_auth(user, password.as_ref());
            }

            match request.send() {
                Ok(response) => return Self::read_response(&url, response),
                Err(e) if e.is_connect() && self.retry && !retried => {
                    warn!(
                        url = %url,
                        delay_secs = self.retry_delay.as_secs(),
                        error = %e,
                        "Connection failed, retrying once"
                    );
                    thread::sleep(self.retry_delay);
                    retried = true;
                }
                Err(e) => return Err(ClientError::new(url, Some(e.to_string()), None).into()),
            }
        }
    }

    fn read_response(url: &str, response: Response) -> StoreResult<Value> {
        let status = response.status();
        let text = response
            .text()
            .map_err(|e| ClientError::new(url, Some(e.to_string()), Some(status.as_u16())))?;

        if !status.is_success() {
            return Err(ClientError::new(url, Some(text), Some(status.as_u16())).into());
        }
        debug!(url = %url, status = status.as_u16(), "API response");
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }
}

/// [`Client`] over an [`HttpApi`].
pub struct HttpClient {
    api: HttpApi,
}

impl HttpClient {
    pub fn new(api: HttpApi) -> Self {
        Self { api }
    }

    pub fn from_config(config: &HttpConfig) -> StoreResult<Self> {
        Ok(Self::new(HttpApi::new(config)?))
    }

    fn sorted_by_id<T>(mut rows: Vec<T>, id: impl Fn(&T) -> i64) -> Vec<T> {
        rows.sort_by_key(|row| id(row));
        rows
    }
}

impl Client for HttpClient {
    fn create_journey(
        &self,
        reference: &str,
        source: &str,
        label: Option<&str>,
    ) -> StoreResult<Journey> {
        if let Some(existing) = self.get_journey(reference, source)? {
            return Ok(existing);
        }
        let created = self.api.post(
            "journeys",
            &json!({"reference": reference, "source": source, "label": label, "complete": false}),
        )?;
        Ok(serde_json::from_value(created)?)
    }

    fn get_journey(&self, reference: &str, source: &str) -> StoreResult<Option<Journey>> {
        self.api.retrieve_single(
            "journeys",
            &[("reference", reference.to_string()), ("source", source.to_string())],
        )
    }

    fn get_journey_by_id(&self, journey_id: i64) -> StoreResult<Option<Journey>> {
        match self.api.get(&format!("journeys/{journey_id}"), &[]) {
            Ok(value) => Ok(Some(serde_json::from_value(value)?)),
            Err(StoreError::Client(ClientError {
                status: Some(404), ..
            })) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn get_journeys(&self) -> StoreResult<Vec<Journey>> {
        self.api.list("journeys", &[])
    }

    fn complete_journey(&self, journey_id: i64) -> StoreResult<()> {
        self.api
            .patch(&format!("journeys/{journey_id}"), &json!({"complete": true}))?;
        Ok(())
    }

    fn set_current_state(&self, journey_id: i64, update: StateUpdate) -> StoreResult<()> {
        let mut body = serde_json::to_value(&update)?;
        body["journey"] = json!(journey_id);
        self.api.post("states", &body)?;
        Ok(())
    }

    fn get_all_states(&self, journey_id: i64) -> StoreResult<Vec<StateRecord>> {
        let states = self.api.list("states", &[("journey", journey_id.to_string())])?;
        Ok(Self::sorted_by_id(states, |s: &StateRecord| s.id))
    }

    fn set_current_step(&self, journey_id: i64, update: StepUpdate) -> StoreResult<()> {
        let existing: Vec<StepRecord> = self.api.list(
            "steps",
            &[("journey", journey_id.to_string()), ("name", update.name.clone())],
        )?;
        let latest = existing.iter().max_by_key(|s| s.id);

        let mut body = serde_json::to_value(&update)?;
        body["journey"] = json!(journey_id);
        match StepWrite::plan(latest, &update) {
            StepWrite::Insert => {
                self.api.post("steps", &body)?;
            }
            StepWrite::Update(id) => {
                self.api.put(&format!("steps/{id}"), &body)?;
            }
            StepWrite::Skip => {}
        }
        Ok(())
    }

    fn get_steps(&self, journey_id: i64) -> StoreResult<Vec<StepRecord>> {
        let steps = self.api.list("steps", &[("journey", journey_id.to_string())])?;
        Ok(Self::sorted_by_id(steps, |s: &StepRecord| s.id))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    /// Serve exactly one canned HTTP response and return the base URL.
    fn respond_once(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut request = [0u8; 8192];
                let _ = stream.read(&mut request);
                let response = format!(
                    "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });
        format!("http://{addr}/api")
    }

    fn api(base_url: String, retry: bool) -> HttpApi {
        HttpApi::new(&HttpConfig {
            base_url,
            retry,
            retry_delay_secs: 0,
            timeout_secs: 5,
            ..HttpConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_url_has_trailing_slash() {
        let api = api("http://localhost:8000/api/".into(), false);
        assert_eq!(api.url("journeys"), "http://localhost:8000/api/journeys/");
        assert_eq!(api.url("/steps/4/"), "http://localhost:8000/api/steps/4/");
    }

    #[test]
    fn test_non_success_status_is_client_error() {
        let base = respond_once("404 Not Found", r#"{"detail":"Not found."}"#);
        let err = api(base, false).get("journeys/9", &[]).unwrap_err();
        match err {
            StoreError::Client(e) => {
                assert_eq!(e.status, Some(404));
                assert!(e.url.ends_with("/api/journeys/9/"));
                assert_eq!(e.payload.as_deref(), Some(r#"{"detail":"Not found."}"#));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_refused_connection_without_retry() {
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let err = api(format!("http://127.0.0.1:{port}/api"), false)
            .get("journeys", &[])
            .unwrap_err();
        assert!(matches!(err, StoreError::Client(ClientError { status: None, .. })));
    }

    #[test]
    fn test_get_journey_reads_paginated_results() {
        let base = respond_once(
            "200 OK",
            r#"{"count":1,"results":[{"id":7,"reference":"A1","source":"admissions","label":null,"complete":false}]}"#,
        );
        let client = HttpClient::new(api(base, false));
        let journey = client.get_journey("A1", "admissions").unwrap().unwrap();
        assert_eq!(journey.id, 7);
        assert!(!journey.complete);
    }

    #[test]
    fn test_single_lookup_rejects_duplicates() {
        let base = respond_once(
            "200 OK",
            r#"[{"id":1,"reference":"A1","source":"s"},{"id":2,"reference":"A1","source":"s"}]"#,
        );
        let err = api(base, false)
            .retrieve_single::<Journey>("journeys", &[])
            .unwrap_err();
        assert!(matches!(err, StoreError::Lookup(_)));
    }
}
