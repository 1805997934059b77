//! RSS 2.0 and Atom 1.0 feeds over the change log.

#![allow(missing_docs)]

use time::format_description::well_known::{Rfc2822, Rfc3339};
use time::OffsetDateTime;

use crate::changes::ChangeEntry;
use crate::gemtext::escape;

/// Where the feed is served from.
#[derive(Debug, Clone)]
pub struct FeedContext {
    pub host: String,
    pub port: u16,
    /// Space of the feed channel itself; cross-space feeds use the root.
    pub space: String,
    pub title: String,
}

/// One feed item: a change entry and the space it happened in.
#[derive(Debug, Clone)]
pub struct FeedItem {
    pub space: String,
    pub change: ChangeEntry,
}

impl FeedContext {
    fn channel_link(&self) -> String {
        format!(
            "gemini://{}:{}{}/",
            self.host,
            self.port,
            space_prefix(&self.space)
        )
    }
}

impl FeedItem {
    fn link(&self, ctx: &FeedContext) -> String {
        let kind = if self.change.is_file() { "file" } else { "page" };
        format!(
            "gemini://{}:{}{}/{}/{}",
            ctx.host,
            ctx.port,
            space_prefix(&self.space),
            kind,
            urlencoding::encode(&self.change.name)
        )
    }

    /// Stable identifier: `tag:<host>,<date>:<space>/<name>?rev=<rev>`.
    fn guid(&self, ctx: &FeedContext) -> String {
        format!(
            "tag:{},{}:{}/{}?rev={}",
            ctx.host,
            self.change.date(),
            self.space,
            self.change.name,
            self.change.revision
        )
    }
}

/// Render an RSS 2.0 document for the given items, newest first.
#[must_use]
pub fn rss(items: &[FeedItem], ctx: &FeedContext) -> String {
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str("<rss version=\"2.0\">\n<channel>\n");
    out.push_str(&format!("<title>{}</title>\n", escape(&ctx.title)));
    out.push_str(&format!("<link>{}</link>\n", escape(&ctx.channel_link())));
    out.push_str("<description>Recent changes</description>\n");
    for item in items {
        out.push_str("<item>\n");
        out.push_str(&format!("<title>{}</title>\n", escape(&item.change.name)));
        out.push_str(&format!("<link>{}</link>\n", escape(&item.link(ctx))));
        out.push_str(&format!(
            "<guid isPermaLink=\"false\">{}</guid>\n",
            escape(&item.guid(ctx))
        ));
        out.push_str(&format!(
            "<pubDate>{}</pubDate>\n",
            rfc2822(item.change.timestamp)
        ));
        out.push_str(&format!(
            "<description>by {}</description>\n",
            escape(&item.change.code)
        ));
        out.push_str("</item>\n");
    }
    out.push_str("</channel>\n</rss>\n");
    out
}

/// Render an Atom 1.0 document for the given items, newest first.
#[must_use]
pub fn atom(items: &[FeedItem], ctx: &FeedContext) -> String {
    let updated = items
        .first()
        .map_or_else(
            || OffsetDateTime::now_utc().unix_timestamp(),
            |item| item.change.timestamp,
        );
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str("<feed xmlns=\"http://www.w3.org/2005/Atom\">\n");
    out.push_str(&format!("<title>{}</title>\n", escape(&ctx.title)));
    out.push_str(&format!(
        "<id>tag:{},2021:{}</id>\n",
        escape(&ctx.host),
        escape(&ctx.space)
    ));
    out.push_str(&format!(
        "<link href=\"{}\"/>\n",
        escape(&ctx.channel_link())
    ));
    out.push_str(&format!("<updated>{}</updated>\n", rfc3339(updated)));
    for item in items {
        out.push_str("<entry>\n");
        out.push_str(&format!("<title>{}</title>\n", escape(&item.change.name)));
        out.push_str(&format!("<id>{}</id>\n", escape(&item.guid(ctx))));
        out.push_str(&format!("<link href=\"{}\"/>\n", escape(&item.link(ctx))));
        out.push_str(&format!(
            "<updated>{}</updated>\n",
            rfc3339(item.change.timestamp)
        ));
        out.push_str(&format!(
            "<author><name>{}</name></author>\n",
            escape(&item.change.code)
        ));
        out.push_str("</entry>\n");
    }
    out.push_str("</feed>\n");
    out
}

fn space_prefix(space: &str) -> String {
    if space.is_empty() {
        String::new()
    } else {
        format!("/{space}")
    }
}

fn rfc2822(timestamp: i64) -> String {
    OffsetDateTime::from_unix_timestamp(timestamp)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
        .format(&Rfc2822)
        .unwrap_or_default()
}

fn rfc3339(timestamp: i64) -> String {
    OffsetDateTime::from_unix_timestamp(timestamp)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
        .format(&Rfc3339)
        .unwrap_or_default()
}
