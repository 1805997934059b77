//! Gemtext line classification and rendering.
//!
//! Gemini responses carry the stored text verbatim; the HTML view is a
//! minimal escaped rendering with relative links rewritten into the current
//! space.

#![allow(missing_docs)]

/// One classified gemtext line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line<'a> {
    /// A line exactly equal to three backticks.
    PreformatToggle,
    /// Any line inside a preformatted block.
    Preformatted(&'a str),
    Link {
        url: &'a str,
        label: &'a str,
    },
    Heading {
        level: u8,
        text: &'a str,
    },
    ListItem(&'a str),
    Quote(&'a str),
    Paragraph(&'a str),
}

/// Classify every line of `text`, tracking preformatted state.
#[must_use]
pub fn parse(text: &str) -> Vec<Line<'_>> {
    let mut lines = Vec::new();
    let mut preformatted = false;
    for raw in text.lines() {
        if raw == "```" {
            preformatted = !preformatted;
            lines.push(Line::PreformatToggle);
            continue;
        }
        if preformatted {
            lines.push(Line::Preformatted(raw));
            continue;
        }
        lines.push(classify(raw));
    }
    lines
}

fn classify(line: &str) -> Line<'_> {
    if let Some(rest) = line.strip_prefix("=>") {
        let trimmed = rest.trim_start_matches([' ', '\t']);
        if trimmed.len() < rest.len() && !trimmed.is_empty() {
            let (url, label) = match trimmed.find([' ', '\t']) {
                Some(at) => (&trimmed[..at], trimmed[at..].trim_start_matches([' ', '\t'])),
                None => (trimmed, ""),
            };
            return Line::Link { url, label };
        }
    }
    for (prefix, level) in [("### ", 3), ("## ", 2), ("# ", 1)] {
        if let Some(text) = line.strip_prefix(prefix) {
            return Line::Heading { level, text };
        }
    }
    if let Some(text) = line.strip_prefix("* ") {
        return Line::ListItem(text);
    }
    if let Some(text) = line.strip_prefix("> ") {
        return Line::Quote(text);
    }
    Line::Paragraph(line)
}

/// Escape text for HTML element and attribute context.
#[must_use]
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Render gemtext to an HTML fragment.
///
/// Relative link targets become `/page/<name>` within `space`; absolute
/// paths are prefixed with the space; URLs with a scheme pass through.
#[must_use]
pub fn to_html(text: &str, space: &str) -> String {
    let prefix = space_prefix(space);
    let mut out = String::new();
    let mut in_pre = false;
    let mut in_list = false;
    for line in parse(text) {
        if !matches!(line, Line::ListItem(_)) && in_list {
            out.push_str("</ul>\n");
            in_list = false;
        }
        match line {
            Line::PreformatToggle => {
                if in_pre {
                    out.push_str("</pre>\n");
                } else {
                    out.push_str("<pre>\n");
                }
                in_pre = !in_pre;
            }
            Line::Preformatted(raw) => {
                out.push_str(&escape(raw));
                out.push('\n');
            }
            Line::Link { url, label } => {
                let href = rewrite_href(url, &prefix);
                let shown = if label.is_empty() { url } else { label };
                out.push_str(&format!(
                    "<p><a href=\"{}\">{}</a></p>\n",
                    escape(&href),
                    escape(shown)
                ));
            }
            Line::Heading { level, text } => {
                out.push_str(&format!("<h{level}>{}</h{level}>\n", escape(text)));
            }
            Line::ListItem(text) => {
                if !in_list {
                    out.push_str("<ul>\n");
                    in_list = true;
                }
                out.push_str(&format!("<li>{}</li>\n", escape(text)));
            }
            Line::Quote(text) => {
                out.push_str(&format!("<blockquote>{}</blockquote>\n", escape(text)));
            }
            Line::Paragraph(text) => {
                if text.is_empty() {
                    out.push_str("<br/>\n");
                } else {
                    out.push_str(&format!("<p>{}</p>\n", escape(text)));
                }
            }
        }
    }
    if in_list {
        out.push_str("</ul>\n");
    }
    if in_pre {
        out.push_str("</pre>\n");
    }
    out
}

/// Wrap an HTML fragment in a complete document.
#[must_use]
pub fn document(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\"/>\n\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\"/>\n\
         <title>{}</title>\n\
         <link rel=\"stylesheet\" href=\"/default.css\"/>\n\
         </head>\n<body>\n{}</body>\n</html>\n",
        escape(title),
        body
    )
}

fn space_prefix(space: &str) -> String {
    if space.is_empty() {
        String::new()
    } else {
        format!("/{space}")
    }
}

fn rewrite_href(url: &str, prefix: &str) -> String {
    if has_scheme(url) {
        url.to_string()
    } else if url.starts_with('/') {
        format!("{prefix}{url}")
    } else {
        format!("{prefix}/page/{url}")
    }
}

fn has_scheme(url: &str) -> bool {
    let Some((scheme, _)) = url.split_once(':') else {
        return false;
    };
    let mut chars = scheme.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}
