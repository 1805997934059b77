//! Titan upload handling.
//!
//! Validation order: target classification, size cap, MIME allow-list,
//! token, then the exact-size body read and the store commit. A success is
//! a `30` redirect to the canonical Gemini URL of the written resource.

use std::io::Read;

use smol_str::SmolStr;
use tracing::info;

use crate::auth;
use crate::error::ServerError;
use crate::request::{Request, RequestKind};
use crate::server::{Context, Response};
use crate::store::Store;

/// What a Titan path edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target<'a> {
    Page(&'a str),
    File(&'a str),
}

/// Handle a Titan request whose body follows on `reader`.
pub fn handle<R: Read>(request: &Request, reader: &mut R, ctx: &Context) -> Response {
    match upload(request, reader, ctx) {
        Ok(response) => response,
        Err(err) => {
            info!(path = %request.path(), space = %request.space, "upload rejected: {err}");
            Response::from_error(&err)
        }
    }
}

fn upload<R: Read>(
    request: &Request,
    reader: &mut R,
    ctx: &Context,
) -> Result<Response, ServerError> {
    let RequestKind::Titan(params) = &request.kind else {
        return Err(ServerError::MalformedRequest("not a titan request".into()));
    };
    let space = ctx
        .config
        .space(&request.host, &request.space)
        .ok_or_else(|| ServerError::MalformedRequest("unknown space".into()))?;

    let target = classify_target(&request.segments)?;
    let name = match target {
        Target::Page(name) | Target::File(name) => name,
    };
    Store::validate_name(name)?;

    match target {
        // Pages accept text/plain implicitly and are bound by the page
        // size limit; binary files are only bound by the MIME allow-list.
        Target::Page(_) => {
            if params.size > ctx.config.page_size_limit {
                return Err(ServerError::SizeLimit(ctx.config.page_size_limit));
            }
            if params.mime != "text/plain" {
                return Err(ServerError::MimeNotAllowed(params.mime.clone()));
            }
        }
        Target::File(_) => {
            if !ctx.config.mime_allowed(&params.mime) {
                return Err(ServerError::MimeNotAllowed(params.mime.clone()));
            }
        }
    }
    auth::authorize_write(
        &ctx.config,
        &ctx.registry,
        space,
        &params.token,
        request.fingerprint.as_deref(),
    )?;

    // Exactly `size` bytes belong to this upload; trailing bytes are not
    // interpreted.
    let mut body = Vec::new();
    reader
        .by_ref()
        .take(params.size)
        .read_to_end(&mut body)
        .map_err(|_| ServerError::ShortRead)?;
    if body.len() as u64 != params.size {
        return Err(ServerError::ShortRead);
    }

    let space_name = request.space.as_str();
    let encoded = urlencoding::encode(name).into_owned();
    match target {
        Target::Page(name) => {
            let text = String::from_utf8(body).map_err(|_| {
                ServerError::MalformedRequest("page body is not valid UTF-8".into())
            })?;
            let revision = ctx.store.write_page(space_name, name, &text, &request.code)?;
            info!(space = space_name, name, revision, "page written");
            Ok(Response::redirect(&format!(
                "{}/page/{encoded}",
                request.base_url()
            )))
        }
        Target::File(name) => {
            ctx.store
                .write_file(space_name, name, &body, &params.mime, &request.code)?;
            info!(space = space_name, name, bytes = params.size, "file written");
            Ok(Response::redirect(&format!(
                "{}/file/{encoded}",
                request.base_url()
            )))
        }
    }
}

/// A path starting `file/` edits a file; `raw/`, `page/`, or a bare name
/// edit the page of that name.
fn classify_target(segments: &[String]) -> Result<Target<'_>, ServerError> {
    match segments {
        [kind, name] if kind == "file" => Ok(Target::File(name.as_str())),
        [kind, name] if kind == "raw" || kind == "page" => Ok(Target::Page(name.as_str())),
        [name] => Ok(Target::Page(name.as_str())),
        _ => Err(ServerError::MalformedRequest(SmolStr::new(format!(
            "'/{}' is not an editable resource",
            segments.join("/")
        )))),
    }
}
