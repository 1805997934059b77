//! Read-only HTTPS mirror of the Gemini routes.
//!
//! HTTP shares the Gemini TLS socket, so responses are framed by hand:
//! status line, `Content-Type`, `Content-Length`, `Connection: close`.
//! `text/gemini` bodies are rendered to HTML; everything else passes
//! through unchanged.

use std::io::Write;

use tracing::debug;

use crate::gemini;
use crate::gemtext;
use crate::request::{Request, RequestKind};
use crate::server::{Context, Response};

const DEFAULT_CSS: &str = include_str!("http/default.css");

const CACHE_FOREVER: &str = "public, max-age=86400, immutable";

/// Handle one HTTP request and write the full response.
pub fn handle<W: Write>(
    writer: &mut W,
    request: &Request,
    ctx: &Context,
) -> std::io::Result<()> {
    let RequestKind::Http { method } = &request.kind else {
        return write_raw(writer, 500, "Internal Server Error", &[], None, false);
    };
    let head_only = method == "HEAD";
    if method != "GET" && method != "HEAD" {
        debug!(%method, "method not allowed");
        return write_raw(
            writer,
            405,
            "Method Not Allowed",
            &[("Allow", "GET, HEAD")],
            None,
            head_only,
        );
    }
    let segments: Vec<&str> = request.segments.iter().map(String::as_str).collect();
    match segments.as_slice() {
        ["default.css"] => {
            let css = ctx.registry.stylesheet().unwrap_or(DEFAULT_CSS);
            write_raw(
                writer,
                200,
                "OK",
                &[
                    ("Content-Type", "text/css; charset=UTF-8"),
                    ("Cache-Control", CACHE_FOREVER),
                ],
                Some(css.as_bytes()),
                head_only,
            )
        }
        ["favicon.ico"] => write_raw(
            writer,
            404,
            "Not Found",
            &[("Cache-Control", CACHE_FOREVER)],
            None,
            head_only,
        ),
        // Writes and input prompts have no read-only mirror.
        ["do", "new"] => write_raw(writer, 404, "Not Found", &[], None, head_only),
        _ => {
            let response = mirror(request, ctx);
            write_response(writer, &response, head_only)
        }
    }
}

/// Run the Gemini route table and render gemtext results as HTML.
fn mirror(request: &Request, ctx: &Context) -> Response {
    let response = gemini::respond(request, ctx);
    if response.status == 20 && response.meta.starts_with("text/gemini") {
        let text = String::from_utf8_lossy(&response.body);
        let fragment = gemtext::to_html(&text, request.space.as_str());
        let title = request
            .segments
            .last()
            .map_or_else(|| request.host.to_string(), String::clone);
        return Response::html(gemtext::document(&title, &fragment));
    }
    response
}

/// Translate a Gemini-shaped response into HTTP framing.
pub fn write_response<W: Write>(
    writer: &mut W,
    response: &Response,
    head_only: bool,
) -> std::io::Result<()> {
    let (code, reason) = match response.status {
        20 => (200, "OK"),
        30 => (302, "Found"),
        40 => (503, "Service Unavailable"),
        51 | 53 => (404, "Not Found"),
        60 | 61 => (403, "Forbidden"),
        _ => (400, "Bad Request"),
    };
    let mut headers: Vec<(&str, &str)> = Vec::new();
    if code == 200 {
        headers.push(("Content-Type", response.meta.as_str()));
    }
    if code == 302 {
        headers.push(("Location", response.meta.as_str()));
    }
    let body = if code == 200 {
        Some(response.body.as_slice())
    } else {
        None
    };
    write_raw(writer, code, reason, &headers, body, head_only)
}

fn write_raw<W: Write>(
    writer: &mut W,
    code: u16,
    reason: &str,
    headers: &[(&str, &str)],
    body: Option<&[u8]>,
    head_only: bool,
) -> std::io::Result<()> {
    write!(writer, "HTTP/1.1 {code} {reason}\r\n")?;
    for (name, value) in headers {
        write!(writer, "{name}: {value}\r\n")?;
    }
    let body = body.unwrap_or_default();
    write!(writer, "Content-Length: {}\r\n", body.len())?;
    write!(writer, "Connection: close\r\n\r\n")?;
    if !head_only {
        writer.write_all(body)?;
    }
    writer.flush()
}
