//! Static file terminal
//!
//! Serves a filesystem directory under a route prefix. The route's base
//! path is stripped from the request path before the file lookup; requests
//! outside the base resolve to 404. Both paths are normalized (leading
//! slash, `.`/`..` segments resolved) so traversal cannot escape the
//! served directory.

use std::path::PathBuf;

use hyper::{Request, Response, StatusCode};
use tracing::debug;

use crate::error::{full_body, status_response, GatewayBody};
use crate::handler::{BoxFuture, Handler};

/// Terminal handler serving files from a directory.
pub struct FilesHandler {
    root: PathBuf,
    base_path: String,
}

impl FilesHandler {
    pub fn new(directory: impl Into<PathBuf>, base_path: &str) -> Self {
        Self {
            root: directory.into(),
            base_path: normalize_path(base_path),
        }
    }

    async fn serve(&self, request_path: &str) -> Response<GatewayBody> {
        serve_file(&self.root, &self.base_path, request_path).await
    }
}

impl Handler for FilesHandler {
    fn handle(&self, req: Request<GatewayBody>) -> BoxFuture {
        let path = req.uri().path().to_string();
        let root = self.root.clone();
        let base_path = self.base_path.clone();
        Box::pin(async move { serve_file(&root, &base_path, &path).await })
    }
}

async fn serve_file(root: &std::path::Path, base_path: &str, request_path: &str) -> Response<GatewayBody> {
    let relative = match strip_base_path(base_path, request_path) {
        Some(rel) => rel,
        None => return status_response(StatusCode::NOT_FOUND),
    };

    let mut file_path = root.join(relative.trim_start_matches('/'));

    match tokio::fs::metadata(&file_path).await {
        Ok(meta) if meta.is_dir() => file_path.push("index.html"),
        Ok(_) => {}
        Err(_) => return status_response(StatusCode::NOT_FOUND),
    }

    match tokio::fs::read(&file_path).await {
        Ok(contents) => Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, content_type_for(&file_path))
            .body(full_body(contents))
            .expect("valid response builder"),
        Err(e) => {
            debug!(path = %file_path.display(), error = %e, "File read failed");
            status_response(StatusCode::NOT_FOUND)
        }
    }
}

/// Remove `base` from the front of `full`, normalizing both. Returns the
/// remaining path with a leading slash, or `None` when `full` is not under
/// `base`.
fn strip_base_path(base: &str, full: &str) -> Option<String> {
    let base = normalize_path(base);
    let full = normalize_path(full);

    if base == "/" {
        return Some(full);
    }

    let rest = full.strip_prefix(&base)?;
    // "/basepath" must not match "/basepathology"
    if !rest.is_empty() && !rest.starts_with('/') {
        return None;
    }

    Some(format!("/{}", rest.trim_start_matches('/')))
}

/// Resolve `.` and `..` segments and collapse repeated slashes, always
/// producing a path with a leading slash.
fn normalize_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }

    if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segments.join("/"))
    }
}

fn content_type_for(path: &std::path::Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
        .as_str()
    {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "text/javascript; charset=utf-8",
        "json" => "application/json",
        "xml" => "application/xml",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "txt" => "text/plain; charset=utf-8",
        "pdf" => "application/pdf",
        "wasm" => "application/wasm",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::full_body;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/a/b/c"), "/a/b/c");
        assert_eq!(normalize_path("a/b"), "/a/b");
        assert_eq!(normalize_path("/a/./b/../c"), "/a/c");
        assert_eq!(normalize_path("/a//b/"), "/a/b");
        assert_eq!(normalize_path("/../.."), "/");
        assert_eq!(normalize_path(""), "/");
    }

    #[test]
    fn test_strip_base_path() {
        assert_eq!(
            strip_base_path("/static", "/static/css/site.css"),
            Some("/css/site.css".to_string())
        );
        assert_eq!(strip_base_path("/static", "/static"), Some("/".to_string()));
        assert_eq!(strip_base_path("/", "/anything"), Some("/anything".to_string()));
        assert_eq!(strip_base_path("/static", "/other/file"), None);
        assert_eq!(strip_base_path("/static", "/staticfile"), None);
    }

    #[test]
    fn test_traversal_cannot_escape_base() {
        // ".." segments resolve before the base check
        assert_eq!(
            strip_base_path("/static", "/static/../etc/passwd"),
            None
        );
        assert_eq!(
            strip_base_path("/static", "/static/a/../b"),
            Some("/b".to_string())
        );
    }

    #[tokio::test]
    async fn test_serves_files_and_404s() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), b"hi there").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/index.html"), b"<p>home</p>").unwrap();

        let handler = FilesHandler::new(dir.path(), "/static");

        let ok = handler.serve("/static/hello.txt").await;
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(
            ok.headers().get(hyper::header::CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );

        // directory falls back to index.html
        let index = handler.serve("/static/sub").await;
        assert_eq!(index.status(), StatusCode::OK);
        assert_eq!(
            index.headers().get(hyper::header::CONTENT_TYPE).unwrap(),
            "text/html; charset=utf-8"
        );

        let missing = handler.serve("/static/nope.txt").await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let outside = handler.serve("/other/hello.txt").await;
        assert_eq!(outside.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_handler_uses_request_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.json"), b"{}").unwrap();

        let handler = FilesHandler::new(dir.path(), "/");
        let req = Request::builder()
            .uri("/a.json")
            .body(full_body(""))
            .unwrap();
        let response = handler.handle(req).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(hyper::header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }
}
