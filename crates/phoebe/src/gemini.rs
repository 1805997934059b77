//! Gemini request handlers: pages, history, search, changes, and feeds.

use std::collections::HashSet;

use smol_str::SmolStr;
use tracing::info;

use crate::changes::ChangeEntry;
use crate::diff;
use crate::error::ServerError;
use crate::feed::{self, FeedContext, FeedItem};
use crate::gemtext;
use crate::request::Request;
use crate::server::{Context, Response};

/// Change-log entries per `/do/changes` page.
pub const CHANGES_PER_PAGE: usize = 30;

/// Hit cap for `/do/match` and `/do/search`.
pub const SEARCH_LIMIT: usize = 100;

/// Distinct pages in `/do/rss` and `/do/atom`.
const FEED_PAGES: usize = 30;

/// Entries in `/do/all/atom`.
const FEED_ENTRIES: usize = 100;

/// Pages in the main-menu blog strip.
const BLOG_LIMIT: usize = 10;

/// Handle one Gemini request, mapping failures to their status.
pub fn respond(request: &Request, ctx: &Context) -> Response {
    match route(request, ctx) {
        Ok(response) => response,
        Err(err) => {
            info!(path = %request.path(), space = %request.space, "request failed: {err}");
            Response::from_error(&err)
        }
    }
}

fn route(request: &Request, ctx: &Context) -> Result<Response, ServerError> {
    let segments: Vec<&str> = request.segments.iter().map(String::as_str).collect();
    match segments.as_slice() {
        [] => main_menu(request, ctx),
        ["robots.txt"] => robots(request, ctx),
        ["page", name] => page(request, ctx, name, None),
        ["page", name, rev] => page(request, ctx, name, Some(parse_revision(rev)?)),
        ["raw", name] => raw(request, ctx, name, None),
        ["raw", name, rev] => raw(request, ctx, name, Some(parse_revision(rev)?)),
        ["html", name] => html(request, ctx, name, None),
        ["html", name, rev] => html(request, ctx, name, Some(parse_revision(rev)?)),
        ["history", name] => history(request, ctx, name),
        ["diff", name, rev] => diff_page(request, ctx, name, parse_revision(rev)?),
        ["file", name] => file(request, ctx, name),
        ["do", "index"] => index(request, ctx),
        ["do", "match"] => match_pages(request, ctx),
        ["do", "search"] => search_pages(request, ctx),
        ["do", "changes"] => changes(request, ctx, 0),
        ["do", "more", offset] => changes(request, ctx, parse_offset(offset)?),
        ["do", "all", "changes"] => all_changes(request, ctx, 0),
        ["do", "all", "more", offset] => all_changes(request, ctx, parse_offset(offset)?),
        ["do", "rss"] => space_feed(request, ctx, FeedKind::Rss),
        ["do", "atom"] => space_feed(request, ctx, FeedKind::Atom),
        ["do", "all", "atom"] => all_atom(request, ctx),
        ["do", "new"] => new_page(request),
        ["do", "spaces"] => spaces(request, ctx),
        ["do", "version"] => Ok(version()),
        _ => Err(ServerError::NotFound(SmolStr::new(request.path()))),
    }
}

fn parse_revision(text: &str) -> Result<u32, ServerError> {
    text.parse()
        .map_err(|_| ServerError::MalformedRequest(SmolStr::new(format!("bad revision '{text}'"))))
}

fn parse_offset(text: &str) -> Result<usize, ServerError> {
    text.parse()
        .map_err(|_| ServerError::MalformedRequest(SmolStr::new(format!("bad offset '{text}'"))))
}

// ---------------------------------------------------------------------------
// Main menu and robots
// ---------------------------------------------------------------------------

fn main_menu(request: &Request, ctx: &Context) -> Result<Response, ServerError> {
    let space = request.space.as_str();
    let prefix = request.space_prefix();
    let mut body = String::new();

    let transcluded = ctx
        .config
        .main_page
        .as_ref()
        .and_then(|name| ctx.store.read_page(space, name).ok());
    match transcluded {
        Some(page) => {
            body.push_str(&page.text);
            if !body.ends_with('\n') {
                body.push('\n');
            }
        }
        None => body.push_str("Welcome to Phoebe!\n"),
    }
    body.push('\n');

    let mut dated: Vec<String> = ctx
        .store
        .list_pages(space)?
        .into_iter()
        .filter(|name| is_iso_dated(name))
        .collect();
    dated.sort();
    dated.reverse();
    dated.truncate(BLOG_LIMIT);
    if !dated.is_empty() {
        body.push_str("## Blog\n");
        for name in &dated {
            body.push_str(&page_link(&prefix, name, None));
        }
        body.push('\n');
    }

    for name in &ctx.config.extra_pages {
        body.push_str(&page_link(&prefix, name, None));
    }
    for item in ctx.registry.menu_items(space) {
        body.push_str(&format!("=> {prefix}{} {}\n", item.url, item.label));
    }
    body.push_str(&format!("=> {prefix}/do/index Index of all pages\n"));
    body.push_str(&format!("=> {prefix}/do/changes Changes\n"));
    body.push_str(&format!("=> {prefix}/do/rss RSS\n"));
    body.push_str(&format!("=> {prefix}/do/atom Atom\n"));
    body.push_str(&format!("=> {prefix}/do/new New page\n"));
    if ctx.config.spaces_for_host(&request.host).count() > 1 {
        body.push_str("=> /do/spaces Space list\n");
    }
    Ok(Response::gemtext(body))
}

/// Pages named like `2026-08-01…` belong to the blog strip.
fn is_iso_dated(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() >= 10
        && bytes[..4].iter().all(u8::is_ascii_digit)
        && bytes[4] == b'-'
        && bytes[5..7].iter().all(u8::is_ascii_digit)
        && bytes[7] == b'-'
        && bytes[8..10].iter().all(u8::is_ascii_digit)
}

fn robots(request: &Request, ctx: &Context) -> Result<Response, ServerError> {
    let mut body = String::new();
    if request.space.is_empty() {
        for space in ctx.config.spaces_for_host(&request.host) {
            push_robots(&mut body, ctx, space.name.as_str());
        }
    } else {
        push_robots(&mut body, ctx, request.space.as_str());
    }
    Ok(Response::plain(body))
}

fn push_robots(body: &mut String, ctx: &Context, space: &str) {
    if let Ok(page) = ctx.store.read_page(space, "robots") {
        body.push_str(&page.text);
        if !body.ends_with('\n') {
            body.push('\n');
        }
        return;
    }
    let prefix = if space.is_empty() {
        String::new()
    } else {
        format!("/{space}")
    };
    body.push_str("User-agent: *\n");
    for path in [
        "/raw/*",
        "/html/*",
        "/diff/*",
        "/history/*",
        "/do/changes*",
        "/do/all/changes*",
        "/do/rss",
        "/do/atom",
        "/do/all/atom",
        "/do/new",
        "/do/more/*",
        "/do/match",
        "/do/search",
    ] {
        body.push_str(&format!("Disallow: {prefix}{path}\n"));
    }
    body.push_str("Crawl-delay: 10\n");
}

// ---------------------------------------------------------------------------
// Pages, revisions, history, diff, files
// ---------------------------------------------------------------------------

fn page(
    request: &Request,
    ctx: &Context,
    name: &str,
    revision: Option<u32>,
) -> Result<Response, ServerError> {
    let space = request.space.as_str();
    let prefix = request.space_prefix();
    let encoded = urlencoding::encode(name).into_owned();
    let mut body;
    match revision {
        None => {
            body = ctx.store.read_page(space, name)?.text;
            ensure_newline(&mut body);
            body.push('\n');
            body.push_str(&format!("=> {prefix}/history/{encoded} History\n"));
            body.push_str(&format!("=> {prefix}/raw/{encoded} Raw text\n"));
            body.push_str(&format!("=> {prefix}/html/{encoded} HTML\n"));
            for footer in ctx.registry.footers(request) {
                body.push_str(&footer);
                ensure_newline(&mut body);
            }
        }
        Some(rev) => {
            body = ctx.store.read_page_revision(space, name, rev)?;
            ensure_newline(&mut body);
            body.push('\n');
            body.push_str(&format!("=> {prefix}/history/{encoded} History\n"));
            body.push_str(&format!("=> {prefix}/raw/{encoded}/{rev} Raw text\n"));
            body.push_str(&format!("=> {prefix}/html/{encoded}/{rev} HTML\n"));
        }
    }
    Ok(Response::gemtext(body))
}

fn raw(
    request: &Request,
    ctx: &Context,
    name: &str,
    revision: Option<u32>,
) -> Result<Response, ServerError> {
    let space = request.space.as_str();
    let text = match revision {
        None => ctx.store.read_page(space, name)?.text,
        Some(rev) => ctx.store.read_page_revision(space, name, rev)?,
    };
    Ok(Response::plain(text))
}

fn html(
    request: &Request,
    ctx: &Context,
    name: &str,
    revision: Option<u32>,
) -> Result<Response, ServerError> {
    let space = request.space.as_str();
    let text = match revision {
        None => ctx.store.read_page(space, name)?.text,
        Some(rev) => ctx.store.read_page_revision(space, name, rev)?,
    };
    let fragment = gemtext::to_html(&text, space);
    Ok(Response::html(gemtext::document(name, &fragment)))
}

fn history(request: &Request, ctx: &Context, name: &str) -> Result<Response, ServerError> {
    let space = request.space.as_str();
    let prefix = request.space_prefix();
    let revisions = ctx.store.revisions(space, name)?;
    if revisions.is_empty() {
        return Err(ServerError::NotFound(SmolStr::new(name)));
    }
    let encoded = urlencoding::encode(name).into_owned();
    let mut body = format!("# History for {name}\n");
    let current_exists = ctx.store.has_page(space, name);
    for (i, rev) in revisions.iter().enumerate() {
        if i == 0 && current_exists {
            body.push_str(&format!("=> {prefix}/page/{encoded} {name} (current)\n"));
        } else {
            body.push_str(&format!("=> {prefix}/page/{encoded}/{rev} Revision {rev}\n"));
        }
        body.push_str(&format!("=> {prefix}/diff/{encoded}/{rev} Diff\n"));
    }
    Ok(Response::gemtext(body))
}

fn diff_page(
    request: &Request,
    ctx: &Context,
    name: &str,
    revision: u32,
) -> Result<Response, ServerError> {
    if revision == 0 {
        return Err(ServerError::MalformedRequest("revisions start at 1".into()));
    }
    let space = request.space.as_str();
    let new = revision_text(ctx, space, name, revision);
    let old = if revision == 1 {
        Some(String::new())
    } else {
        revision_text(ctx, space, name, revision - 1)
    };
    if new.is_none() && old.as_deref().is_none_or(str::is_empty) {
        return Err(ServerError::NotFound(SmolStr::new(format!(
            "{name} revision {revision}"
        ))));
    }
    // A deletion revision has no stored text; diff it as empty.
    let new = new.unwrap_or_default();
    let old = old.unwrap_or_default();
    let diff = diff::diff(&old, &new);
    let mut body = format!(
        "# Differences for {name}, revision {} to {revision}\n\n",
        revision - 1
    );
    if diff.is_empty() {
        body.push_str("No difference.\n");
    } else {
        body.push_str("```\n");
        body.push_str(&diff);
        body.push_str("```\n");
    }
    Ok(Response::gemtext(body))
}

fn revision_text(ctx: &Context, space: &str, name: &str, revision: u32) -> Option<String> {
    ctx.store.read_page_revision(space, name, revision).ok()
}

fn file(request: &Request, ctx: &Context, name: &str) -> Result<Response, ServerError> {
    let (bytes, mime) = ctx.store.read_file(request.space.as_str(), name)?;
    Ok(Response::success(&mime, bytes))
}

// ---------------------------------------------------------------------------
// Index, match, search
// ---------------------------------------------------------------------------

fn index(request: &Request, ctx: &Context) -> Result<Response, ServerError> {
    let prefix = request.space_prefix();
    let mut body = String::from("# All pages\n");
    for name in ctx.store.list_pages(request.space.as_str())? {
        body.push_str(&page_link(&prefix, &name, None));
    }
    Ok(Response::gemtext(body))
}

fn match_pages(request: &Request, ctx: &Context) -> Result<Response, ServerError> {
    let Some(query) = request.query.as_deref().filter(|q| !q.is_empty()) else {
        return Ok(Response::input("Page name"));
    };
    let prefix = request.space_prefix();
    let needle = query.to_lowercase();
    let mut body = format!("# Pages matching {query}\n");
    let mut hits = 0;
    for name in ctx.store.list_pages(request.space.as_str())? {
        if name.to_lowercase().contains(&needle) {
            if hits == SEARCH_LIMIT {
                body.push_str("Search stopped after 100 results.\n");
                break;
            }
            body.push_str(&page_link(&prefix, &name, None));
            hits += 1;
        }
    }
    if hits == 0 {
        body.push_str("No matching pages.\n");
    }
    Ok(Response::gemtext(body))
}

fn search_pages(request: &Request, ctx: &Context) -> Result<Response, ServerError> {
    let Some(query) = request.query.as_deref().filter(|q| !q.is_empty()) else {
        return Ok(Response::input("Search term"));
    };
    let space = request.space.as_str();
    let prefix = request.space_prefix();
    let needle = query.to_lowercase();
    let mut body = format!("# Search for {query}\n");
    let mut hits = 0;
    for name in ctx.store.list_pages(space)? {
        let Ok(page) = ctx.store.read_page(space, &name) else {
            continue;
        };
        if page.text.to_lowercase().contains(&needle) || name.to_lowercase().contains(&needle) {
            if hits == SEARCH_LIMIT {
                body.push_str("Search stopped after 100 results.\n");
                break;
            }
            body.push_str(&page_link(&prefix, &name, None));
            hits += 1;
        }
    }
    if hits == 0 {
        body.push_str("Nothing found.\n");
    }
    Ok(Response::gemtext(body))
}

// ---------------------------------------------------------------------------
// Changes and feeds
// ---------------------------------------------------------------------------

fn changes(request: &Request, ctx: &Context, offset: usize) -> Result<Response, ServerError> {
    let prefix = request.space_prefix();
    let entries = ctx
        .store
        .read_changes(request.space.as_str(), CHANGES_PER_PAGE + 1, offset)?;
    let mut body = String::from("# Changes\n");
    if entries.is_empty() {
        body.push_str("No changes yet.\n");
        return Ok(Response::gemtext(body));
    }
    let mut last_date = None;
    for entry in entries.iter().take(CHANGES_PER_PAGE) {
        let date = entry.date();
        if last_date != Some(date) {
            body.push_str(&format!("## {date}\n"));
            last_date = Some(date);
        }
        body.push_str(&change_line(&prefix, "", entry));
    }
    if entries.len() > CHANGES_PER_PAGE {
        body.push_str(&format!(
            "=> {prefix}/do/more/{} More\n",
            offset + CHANGES_PER_PAGE
        ));
    }
    Ok(Response::gemtext(body))
}

fn all_changes(request: &Request, ctx: &Context, offset: usize) -> Result<Response, ServerError> {
    let items = host_changes(request, ctx, offset + CHANGES_PER_PAGE + 1)?;
    let mut body = String::from("# Changes in all spaces\n");
    if items.len() <= offset {
        body.push_str("No changes yet.\n");
        return Ok(Response::gemtext(body));
    }
    let mut last_date = None;
    for (space, entry) in items.iter().skip(offset).take(CHANGES_PER_PAGE) {
        let date = entry.date();
        if last_date != Some(date) {
            body.push_str(&format!("## {date}\n"));
            last_date = Some(date);
        }
        let prefix = if space.is_empty() {
            String::new()
        } else {
            format!("/{space}")
        };
        body.push_str(&change_line(&prefix, space, entry));
    }
    if items.len() > offset + CHANGES_PER_PAGE {
        body.push_str(&format!(
            "=> /do/all/more/{} More\n",
            offset + CHANGES_PER_PAGE
        ));
    }
    Ok(Response::gemtext(body))
}

/// Merge the change logs of every space of the request's host, newest first.
fn host_changes(
    request: &Request,
    ctx: &Context,
    limit: usize,
) -> Result<Vec<(SmolStr, ChangeEntry)>, ServerError> {
    let mut items = Vec::new();
    for space in ctx.config.spaces_for_host(&request.host) {
        for entry in ctx.store.read_changes(space.name.as_str(), limit, 0)? {
            items.push((space.name.clone(), entry));
        }
    }
    items.sort_by(|a, b| b.1.timestamp.cmp(&a.1.timestamp));
    items.truncate(limit);
    Ok(items)
}

fn change_line(prefix: &str, space: &str, entry: &ChangeEntry) -> String {
    let encoded = urlencoding::encode(&entry.name);
    let shown = if space.is_empty() {
        entry.name.to_string()
    } else {
        format!("{space}/{}", entry.name)
    };
    if entry.is_file() {
        format!(
            "=> {prefix}/file/{encoded} {shown} (file) by {}\n",
            entry.code
        )
    } else {
        format!(
            "=> {prefix}/page/{encoded}/{} {shown} (revision {}) by {}\n",
            entry.revision, entry.revision, entry.code
        )
    }
}

enum FeedKind {
    Rss,
    Atom,
}

fn space_feed(request: &Request, ctx: &Context, kind: FeedKind) -> Result<Response, ServerError> {
    let space = request.space.as_str();
    let entries = ctx.store.read_changes(space, usize::MAX, 0)?;
    let mut seen = HashSet::new();
    let mut items = Vec::new();
    for entry in entries {
        if seen.insert(entry.name.clone()) {
            items.push(FeedItem {
                space: space.to_string(),
                change: entry,
            });
            if items.len() == FEED_PAGES {
                break;
            }
        }
    }
    let feed_ctx = feed_context(request);
    Ok(match kind {
        FeedKind::Rss => Response::success(
            "application/rss+xml",
            feed::rss(&items, &feed_ctx).into_bytes(),
        ),
        FeedKind::Atom => Response::success(
            "application/atom+xml",
            feed::atom(&items, &feed_ctx).into_bytes(),
        ),
    })
}

fn all_atom(request: &Request, ctx: &Context) -> Result<Response, ServerError> {
    let items: Vec<FeedItem> = host_changes(request, ctx, FEED_ENTRIES)?
        .into_iter()
        .map(|(space, change)| FeedItem {
            space: space.to_string(),
            change,
        })
        .collect();
    let mut feed_ctx = feed_context(request);
    feed_ctx.space = String::new();
    Ok(Response::success(
        "application/atom+xml",
        feed::atom(&items, &feed_ctx).into_bytes(),
    ))
}

fn feed_context(request: &Request) -> FeedContext {
    let title = if request.space.is_empty() {
        format!("{} changes", request.host)
    } else {
        format!("{} changes in {}", request.host, request.space)
    };
    FeedContext {
        host: request.host.to_string(),
        port: request.port,
        space: request.space.to_string(),
        title,
    }
}

// ---------------------------------------------------------------------------
// New page, spaces, version
// ---------------------------------------------------------------------------

fn new_page(request: &Request) -> Result<Response, ServerError> {
    let Some(name) = request.query.as_deref().filter(|q| !q.is_empty()) else {
        return Ok(Response::input("New page name"));
    };
    // Gemini has no forms; the edit affordance is the Titan URL.
    Ok(Response::redirect(&format!(
        "titan://{}:{}{}/raw/{}",
        request.host,
        request.port,
        request.space_prefix(),
        urlencoding::encode(name)
    )))
}

fn spaces(request: &Request, ctx: &Context) -> Result<Response, ServerError> {
    let mut body = String::from("# Spaces\n");
    for space in ctx.config.spaces_for_host(&request.host) {
        if space.name.is_empty() {
            body.push_str(&format!("=> / {}\n", request.host));
        } else {
            body.push_str(&format!("=> /{}/ {}\n", space.name, space.name));
        }
    }
    Ok(Response::gemtext(body))
}

fn version() -> Response {
    Response::gemtext(format!("Phoebe {}\n", env!("CARGO_PKG_VERSION")))
}

fn page_link(prefix: &str, name: &str, label: Option<&str>) -> String {
    format!(
        "=> {prefix}/page/{} {}\n",
        urlencoding::encode(name),
        label.unwrap_or(name)
    )
}

fn ensure_newline(body: &mut String) {
    if !body.ends_with('\n') {
        body.push('\n');
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blog_names_need_a_full_iso_date() {
        assert!(is_iso_dated("2026-08-01"));
        assert!(is_iso_dated("2026-08-01 Launch day"));
        assert!(!is_iso_dated("2026-8-1 short"));
        assert!(!is_iso_dated("Launch 2026-08-01"));
        assert!(!is_iso_dated("2026_08_01"));
    }

    #[test]
    fn change_lines_link_revisions_and_files() {
        let entry = ChangeEntry {
            timestamp: 0,
            name: SmolStr::new("Some Page"),
            revision: 2,
            code: SmolStr::new("0042"),
        };
        assert_eq!(
            change_line("", "", &entry),
            "=> /page/Some%20Page/2 Some Page (revision 2) by 0042\n"
        );
        let file = ChangeEntry {
            revision: 0,
            ..entry
        };
        assert_eq!(
            change_line("/notes", "notes", &file),
            "=> /notes/file/Some%20Page notes/Some Page (file) by 0042\n"
        );
    }
}
