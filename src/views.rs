//! Error view rendering.
//!
//! The configured views directory may provide an `error.html` template using
//! `{{status}}`, `{{message}}` and `{{error}}` placeholders. Without one, a
//! built-in template is used.

use crate::middleware::RequestFailure;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use std::path::Path;

/// The only engine understood natively.
pub const HTML_ENGINE: &str = "html";

const ERROR_TEMPLATE_NAME: &str = "error";

const BUILTIN_ERROR_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
  <head><title>{{status}} {{message}}</title></head>
  <body>
    <h1>{{message}}</h1>
    <h2>{{status}}</h2>
    <pre>{{error}}</pre>
  </body>
</html>
"#;

#[derive(Debug, Clone)]
pub struct ErrorView {
    template: String,
}

impl ErrorView {
    pub fn builtin() -> Self {
        Self {
            template: BUILTIN_ERROR_TEMPLATE.to_string(),
        }
    }

    /// Load `{views_path}/error.{engine}`, falling back to the built-in template.
    pub fn load(views_path: impl AsRef<Path>, engine: &str) -> Self {
        if engine != HTML_ENGINE {
            tracing::warn!(%engine, "unsupported view engine, using the built-in error view");
            return Self::builtin();
        }

        let path = views_path
            .as_ref()
            .join(format!("{ERROR_TEMPLATE_NAME}.{engine}"));
        match std::fs::read_to_string(&path) {
            Ok(template) => {
                tracing::debug!(path = %path.display(), "loaded error view");
                Self { template }
            }
            Err(_) => Self::builtin(),
        }
    }

    pub fn render(&self, failure: &RequestFailure, verbose: bool) -> Response {
        let error = if verbose {
            failure.detail.as_deref().unwrap_or_default()
        } else {
            ""
        };
        let body = self
            .template
            .replace("{{status}}", failure.status.as_str())
            .replace("{{message}}", &escape_html(&failure.message))
            .replace("{{error}}", &escape_html(error));

        (
            failure.status,
            [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
            body,
        )
            .into_response()
    }
}

impl Default for ErrorView {
    fn default() -> Self {
        Self::builtin()
    }
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use axum::http::StatusCode;

    async fn body_of(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn custom_template_is_used() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("error.html"),
            "<p>{{status}}|{{message}}|{{error}}</p>",
        )
        .unwrap();

        let view = ErrorView::load(dir.path(), HTML_ENGINE);
        let failure = RequestFailure::new(StatusCode::BAD_GATEWAY, "<upstream>").with_detail("trace");

        let response = view.render(&failure, true);
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(body_of(response).await, "<p>502|&lt;upstream&gt;|trace</p>");
    }

    #[tokio::test]
    async fn missing_template_or_engine_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let failure = RequestFailure::not_found();

        for view in [
            ErrorView::load(dir.path(), HTML_ENGINE),
            ErrorView::load(dir.path(), "pug"),
        ] {
            let body = body_of(view.render(&failure, false)).await;
            assert!(body.contains("<h1>Not Found</h1>"));
        }
    }
}
