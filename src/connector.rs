//! Base for outbound REST connectors used by resolvers.
//!
//! A [`RestConnector`] carries the default header set, the caller's session
//! cookie and, optionally, the configuration used to resolve remote service
//! endpoints. Response handling is selected by type through [`FromResponse`]:
//! ask for `Json<T>`, `String`, `Bytes` or the whole [`FullResponse`].

use crate::config::Configuration;
use crate::error::{Error, Result};
use async_trait::async_trait;
use axum::body::Bytes;
use http::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_DISPOSITION, CONTENT_TYPE, COOKIE,
};
use http::{Method, StatusCode};
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::sync::Arc;

const DEFAULT_ACCEPT: &str = "application/json, text/plain, */*";
const DEFAULT_CONTENT_TYPE: &str = "application/json";
const UNKNOWN_FILENAME: &str = "unknown";

/// Per-request options: extra headers, JSON body and query parameters.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub headers: HeaderMap,
    pub body: Option<serde_json::Value>,
    pub query: Vec<(String, String)>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }
}

/// Parsed JSON body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Json<T>(pub T);

/// Status, headers and raw body of a response.
#[derive(Debug, Clone)]
pub struct FullResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Downloaded file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Download {
    pub filename: String,
    pub body: Bytes,
}

/// Shape a successful response is converted into.
#[async_trait]
pub trait FromResponse: Sized {
    async fn from_response(response: reqwest::Response) -> Result<Self>;
}

#[async_trait]
impl<T> FromResponse for Json<T>
where
    T: DeserializeOwned + Send + 'static,
{
    async fn from_response(response: reqwest::Response) -> Result<Self> {
        let bytes = response.bytes().await?;
        Ok(Json(serde_json::from_slice(&bytes)?))
    }
}

#[async_trait]
impl FromResponse for String {
    async fn from_response(response: reqwest::Response) -> Result<Self> {
        Ok(response.text().await?)
    }
}

#[async_trait]
impl FromResponse for Bytes {
    async fn from_response(response: reqwest::Response) -> Result<Self> {
        Ok(response.bytes().await?)
    }
}

#[async_trait]
impl FromResponse for FullResponse {
    async fn from_response(response: reqwest::Response) -> Result<Self> {
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        Ok(FullResponse {
            status,
            headers,
            body,
        })
    }
}

/// HTTP client with the shared default headers.
///
/// `accept-encoding: gzip, deflate, br` is negotiated by the client itself so
/// compressed bodies are decoded transparently.
#[derive(Debug, Clone)]
pub struct RestConnector {
    client: Client,
    default_headers: HeaderMap,
    configuration: Option<Arc<Configuration>>,
}

impl RestConnector {
    /// A non-empty `cookie` is sent with every request.
    pub fn new(cookie: Option<&str>) -> Result<Self> {
        let client = Client::builder().build()?;

        let mut default_headers = HeaderMap::new();
        default_headers.insert(ACCEPT, HeaderValue::from_static(DEFAULT_ACCEPT));
        default_headers.insert(CONTENT_TYPE, HeaderValue::from_static(DEFAULT_CONTENT_TYPE));
        if let Some(cookie) = cookie.filter(|c| !c.is_empty()) {
            let value = HeaderValue::from_str(cookie)
                .map_err(|e| Error::Internal(format!("invalid cookie header: {e}")))?;
            default_headers.insert(COOKIE, value);
        }

        Ok(Self {
            client,
            default_headers,
            configuration: None,
        })
    }

    pub fn with_configuration(mut self, configuration: Arc<Configuration>) -> Self {
        self.configuration = Some(configuration);
        self
    }

    pub fn default_headers(&self) -> &HeaderMap {
        &self.default_headers
    }

    /// URL of the remote service `name` for the current environment.
    pub fn endpoint(&self, name: &str) -> Result<&str> {
        match &self.configuration {
            Some(configuration) => configuration.endpoint(name),
            None => Err(Error::Internal(
                "connector has no configuration to resolve endpoints".to_string(),
            )),
        }
    }

    pub async fn get<R: FromResponse>(&self, url: &str, options: RequestOptions) -> Result<R> {
        self.request(Method::GET, url, options).await
    }

    pub async fn post<R: FromResponse>(&self, url: &str, options: RequestOptions) -> Result<R> {
        self.request(Method::POST, url, options).await
    }

    pub async fn put<R: FromResponse>(&self, url: &str, options: RequestOptions) -> Result<R> {
        self.request(Method::PUT, url, options).await
    }

    pub async fn delete<R: FromResponse>(&self, url: &str, options: RequestOptions) -> Result<R> {
        self.request(Method::DELETE, url, options).await
    }

    /// Fetch a binary resource named by its `content-disposition` header.
    pub async fn download(&self, url: &str) -> Result<Download> {
        let response: FullResponse = self.get(url, RequestOptions::default()).await?;
        let disposition = response
            .headers
            .get(CONTENT_DISPOSITION)
            .ok_or(Error::MissingFilenameHeader)?;

        Ok(Download {
            filename: extract_filename(&String::from_utf8_lossy(disposition.as_bytes())),
            body: response.body,
        })
    }

    async fn request<R: FromResponse>(
        &self,
        method: Method,
        url: &str,
        options: RequestOptions,
    ) -> Result<R> {
        let headers = self.merge_headers(&options.headers);
        tracing::debug!(%method, %url, "outbound request");

        let mut builder = self.client.request(method, url).headers(headers);
        if !options.query.is_empty() {
            builder = builder.query(&options.query);
        }
        if let Some(body) = &options.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::UpstreamStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        R::from_response(response).await
    }

    /// Defaults overlaid by the caller's headers.
    fn merge_headers(&self, extra: &HeaderMap) -> HeaderMap {
        let mut headers = self.default_headers.clone();
        for name in extra.keys() {
            headers.remove(name);
        }
        for (name, value) in extra {
            headers.append(name.clone(), value.clone());
        }
        headers
    }
}

/// Filename from a `content-disposition` value.
///
/// Prefers the `filename*=<charset>''<encoded>` form (`+` read as space),
/// then a plain `filename=`, and yields `"unknown"` otherwise.
pub fn extract_filename(disposition: &str) -> String {
    if let Some(start) = disposition.find("filename*=") {
        let extended = &disposition[start + "filename*=".len()..];
        if let Some(split) = extended.rfind("''") {
            let encoded = &extended[split + 2..];
            let decoded = urlencoding::decode(encoded)
                .map(|d| d.into_owned())
                .unwrap_or_else(|_| encoded.to_string());
            return decoded.replace('+', " ");
        }
    }

    disposition
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("filename="))
        .map(|name| name.trim_matches('"').to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| UNKNOWN_FILENAME.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BaseConfig, EnvOverrides};
    use axum::{
        extract::Query,
        routing::{get, post, put},
        Router,
    };
    use serde::Deserialize;
    use std::collections::HashMap;

    async fn spawn_upstream() -> String {
        let app = Router::new()
            .route(
                "/echo",
                get(|headers: HeaderMap, Query(q): Query<HashMap<String, String>>| async move {
                    let header = |name: &str| {
                        headers
                            .get(name)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default()
                            .to_string()
                    };
                    axum::Json(serde_json::json!({
                        "accept": header("accept"),
                        "acceptEncoding": header("accept-encoding"),
                        "contentType": header("content-type"),
                        "cookie": header("cookie"),
                        "page": q.get("page").cloned().unwrap_or_default(),
                    }))
                }),
            )
            .route(
                "/items",
                post(|axum::Json(body): axum::Json<serde_json::Value>| async move {
                    axum::Json(serde_json::json!({ "created": body["name"] }))
                }),
            )
            .route("/items/1", put(|| async { "updated" }).delete(|| async { "deleted" }))
            .route(
                "/fail",
                get(|| async { (axum::http::StatusCode::BAD_GATEWAY, "nope") }),
            )
            .route(
                "/file",
                get(|| async {
                    (
                        [(
                            axum::http::header::CONTENT_DISPOSITION,
                            "attachment; filename*=UTF-8''quarterly%20report+2024.pdf",
                        )],
                        vec![0u8, 1, 2, 3],
                    )
                }),
            )
            .route("/bare", get(|| async { vec![9u8] }));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Echo {
        accept: String,
        accept_encoding: String,
        content_type: String,
        cookie: String,
        page: String,
    }

    #[tokio::test]
    async fn default_headers_and_cookie_are_sent() {
        let base = spawn_upstream().await;
        let connector = RestConnector::new(Some("session=abc")).unwrap();

        let Json(echo): Json<Echo> = connector
            .get(&format!("{base}/echo"), RequestOptions::new().query("page", "2"))
            .await
            .unwrap();

        assert_eq!(echo.accept, DEFAULT_ACCEPT);
        assert_eq!(echo.content_type, "application/json");
        assert_eq!(echo.cookie, "session=abc");
        assert_eq!(echo.page, "2");
        assert!(echo.accept_encoding.contains("gzip"));
    }

    #[tokio::test]
    async fn caller_headers_win_and_empty_cookie_is_dropped() {
        let base = spawn_upstream().await;
        let connector = RestConnector::new(Some("")).unwrap();
        assert!(connector.default_headers().get(COOKIE).is_none());

        let options = RequestOptions::new().header(ACCEPT, HeaderValue::from_static("text/csv"));
        let Json(echo): Json<Echo> = connector
            .get(&format!("{base}/echo"), options)
            .await
            .unwrap();
        assert_eq!(echo.accept, "text/csv");
        assert_eq!(echo.cookie, "");
    }

    #[tokio::test]
    async fn verbs_and_response_shapes() {
        let base = spawn_upstream().await;
        let connector = RestConnector::new(None).unwrap();

        let Json(created): Json<serde_json::Value> = connector
            .post(
                &format!("{base}/items"),
                RequestOptions::new().body(serde_json::json!({ "name": "widget" })),
            )
            .await
            .unwrap();
        assert_eq!(created["created"], "widget");

        let updated: String = connector
            .put(&format!("{base}/items/1"), RequestOptions::new())
            .await
            .unwrap();
        assert_eq!(updated, "updated");

        let full: FullResponse = connector
            .delete(&format!("{base}/items/1"), RequestOptions::new())
            .await
            .unwrap();
        assert_eq!(full.status, StatusCode::OK);
        assert_eq!(&full.body[..], b"deleted");
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let base = spawn_upstream().await;
        let connector = RestConnector::new(None).unwrap();

        let err = connector
            .get::<Bytes>(&format!("{base}/fail"), RequestOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UpstreamStatus { status: 502, .. }));
    }

    #[tokio::test]
    async fn download_reads_filename() {
        let base = spawn_upstream().await;
        let connector = RestConnector::new(None).unwrap();

        let file = connector.download(&format!("{base}/file")).await.unwrap();
        assert_eq!(file.filename, "quarterly report 2024.pdf");
        assert_eq!(&file.body[..], &[0, 1, 2, 3]);

        let err = connector.download(&format!("{base}/bare")).await.unwrap_err();
        assert!(matches!(err, Error::MissingFilenameHeader));
    }

    #[test]
    fn filename_fallbacks() {
        assert_eq!(extract_filename("attachment; filename=\"a.txt\""), "a.txt");
        assert_eq!(extract_filename("attachment"), "unknown");
        assert_eq!(
            extract_filename("attachment; filename*=utf-8''r%C3%A9sum%C3%A9.pdf"),
            "résumé.pdf"
        );
    }

    #[test]
    fn endpoint_uses_configuration() {
        let base = BaseConfig::from_value(serde_json::json!({
            "defaults": { "addr": "0.0.0.0", "port": 4000 },
            "cors": { "enabled": false },
            "rest": { "path": "/rest" },
            "graphql": { "path": "/graphql" },
            "remotes": { "billing": "https://billing.example/api" }
        }))
        .unwrap();
        let configuration =
            Configuration::load_with_env(base, serde_json::Value::Null, EnvOverrides::default())
                .unwrap();

        let connector = RestConnector::new(None).unwrap();
        assert!(connector.endpoint("billing").is_err());

        let connector = connector.with_configuration(Arc::new(configuration));
        assert_eq!(
            connector.endpoint("billing").unwrap(),
            "https://billing.example/api"
        );
        assert!(matches!(
            connector.endpoint("ledger"),
            Err(Error::UnknownService(_))
        ));
    }
}
