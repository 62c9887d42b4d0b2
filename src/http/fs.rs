use crate::http::handler::{HttpRequestHandler, Responder};
use crate::http::request::{HttpRequest, Method};

use std::path::{Component, Path, PathBuf};

/// Complete response sent when a file cannot be served.
const NOT_FOUND: &[u8] = b"HTTP/1.1 404 Not Found\r\nContent-Length: 35\r\nConnection: close\r\n\r\n<HTML><BODY>Not Found</BODY></HTML>";

/// A stock request handler mapping `GET` URIs onto files under a root
/// directory.
///
/// No content-type mapping, no directory listings; a path either opens
/// and streams, or the canned 404 goes out. Paths escaping the root are
/// rejected outright.
pub struct FileSystemHandler {
    root: PathBuf,
}

impl FileSystemHandler {
    pub fn new(root: impl Into<PathBuf>) -> FileSystemHandler {
        FileSystemHandler { root: root.into() }
    }

    fn resolve(&self, uri: &str) -> Option<PathBuf> {
        // Ignore any query string; the path part decides.
        let path = uri.split('?').next().unwrap_or(uri);
        let relative = Path::new(path.trim_start_matches('/'));

        if relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_)))
        {
            return None;
        }

        Some(self.root.join(relative))
    }
}

impl HttpRequestHandler for FileSystemHandler {
    fn request(&self, responder: &mut Responder, request: &HttpRequest<'_>) {
        if request.method() != Method::Get {
            responder.respond_with_static(request, NOT_FOUND);
            return;
        }

        let Some(path) = self.resolve(request.uri()) else {
            tracing::debug!(uri = request.uri(), "path rejected");
            responder.respond_with_static(request, NOT_FOUND);
            return;
        };

        if let Err(err) = responder.respond_with_file(request, &path) {
            tracing::debug!(path = %path.display(), error = %err, "file not served");
            responder.respond_with_static(request, NOT_FOUND);
        }
    }
}
