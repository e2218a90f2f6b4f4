//! Feed Payload Parsing
//!
//! RSS 2.0 / Atom item extraction and HTML cleanup. Feeds carry threat
//! reports as prose; each item becomes one raw document downstream.

use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use regex::Regex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FeedParseError {
    #[error("malformed feed xml at byte {position}: {message}")]
    Xml { position: usize, message: String },
}

/// One entry of an RSS/Atom feed, fields still HTML-encoded.
#[derive(Debug, Clone, Default)]
pub struct FeedItem {
    pub title: String,
    pub link: Option<String>,
    pub description: String,
    pub content: String,
    pub published: Option<DateTime<Utc>>,
}

impl FeedItem {
    /// Preferred body text: full content when present, else the description.
    pub fn body(&self) -> &str {
        if self.content.trim().is_empty() {
            &self.description
        } else {
            &self.content
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Field {
    Title,
    Link,
    Description,
    Content,
    Published,
}

/// Parses feed XML and cleans item bodies. Regexes are compiled once at
/// construction, pattern-set style.
pub struct FeedParser {
    tag_re: Regex,
    ws_re: Regex,
}

impl FeedParser {
    pub fn new() -> Self {
        Self {
            tag_re: Regex::new(r"<[^>]+>").expect("invalid html tag pattern"),
            ws_re: Regex::new(r"\s+").expect("invalid whitespace pattern"),
        }
    }

    /// Parse an RSS 2.0 or Atom document into its items. Malformed XML is a
    /// hard error; an empty or item-less feed is simply an empty vec.
    pub fn parse(&self, xml: &str) -> Result<Vec<FeedItem>, FeedParseError> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        let mut items = Vec::new();
        let mut current: Option<FeedItem> = None;
        let mut field: Option<Field> = None;

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    let name = e.local_name();
                    match name.as_ref() {
                        b"item" | b"entry" => {
                            current = Some(FeedItem::default());
                            field = None;
                        }
                        b"title" if current.is_some() => field = Some(Field::Title),
                        b"description" | b"summary" if current.is_some() => {
                            field = Some(Field::Description)
                        }
                        // <content:encoded> (RSS) has local name "encoded"
                        b"encoded" | b"content" if current.is_some() => {
                            field = Some(Field::Content)
                        }
                        b"link" if current.is_some() => {
                            // Atom links carry the target in an href attribute
                            if let Ok(Some(href)) = e.try_get_attribute("href") {
                                if let (Some(item), Ok(value)) =
                                    (current.as_mut(), href.unescape_value())
                                {
                                    item.link = Some(value.into_owned());
                                }
                                field = None;
                            } else {
                                field = Some(Field::Link);
                            }
                        }
                        b"pubDate" | b"published" | b"updated" if current.is_some() => {
                            field = Some(Field::Published)
                        }
                        _ => field = None,
                    }
                }
                Ok(Event::Empty(e)) => {
                    if e.local_name().as_ref() == b"link" {
                        if let Ok(Some(href)) = e.try_get_attribute("href") {
                            if let (Some(item), Ok(value)) =
                                (current.as_mut(), href.unescape_value())
                            {
                                if item.link.is_none() {
                                    item.link = Some(value.into_owned());
                                }
                            }
                        }
                    }
                }
                Ok(Event::Text(t)) => {
                    let text = t.unescape().map_err(|e| FeedParseError::Xml {
                        position: reader.buffer_position(),
                        message: e.to_string(),
                    })?;
                    append_field(&mut current, field, &text);
                }
                Ok(Event::CData(t)) => {
                    let bytes = t.into_inner();
                    let text = String::from_utf8_lossy(&bytes);
                    append_field(&mut current, field, &text);
                }
                Ok(Event::End(e)) => match e.local_name().as_ref() {
                    b"item" | b"entry" => {
                        if let Some(item) = current.take() {
                            if !item.title.trim().is_empty() || !item.body().trim().is_empty() {
                                items.push(item);
                            }
                        }
                        field = None;
                    }
                    _ => field = None,
                },
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => {
                    return Err(FeedParseError::Xml {
                        position: reader.buffer_position(),
                        message: e.to_string(),
                    })
                }
            }
        }

        Ok(items)
    }

    /// Strip HTML tags, decode common entities, collapse whitespace.
    pub fn clean_html(&self, text: &str) -> String {
        let stripped = self.tag_re.replace_all(text, " ");
        let decoded = decode_entities(&stripped);
        self.ws_re.replace_all(&decoded, " ").trim().to_string()
    }
}

impl Default for FeedParser {
    fn default() -> Self {
        Self::new()
    }
}

fn append_field(current: &mut Option<FeedItem>, field: Option<Field>, text: &str) {
    let Some(item) = current.as_mut() else {
        return;
    };
    match field {
        Some(Field::Title) => push_text(&mut item.title, text),
        Some(Field::Description) => push_text(&mut item.description, text),
        Some(Field::Content) => push_text(&mut item.content, text),
        Some(Field::Link) => {
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                item.link = Some(trimmed.to_string());
            }
        }
        Some(Field::Published) => {
            if item.published.is_none() {
                item.published = parse_date(text.trim());
            }
        }
        None => {}
    }
}

fn push_text(target: &mut String, text: &str) {
    if !target.is_empty() {
        target.push(' ');
    }
    target.push_str(text);
}

fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn decode_entities(text: &str) -> String {
    text.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&nbsp;", " ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSS_SAMPLE: &str = r#"<?xml version="1.0"?>
        <rss version="2.0"><channel>
            <title>Feed Title</title>
            <item>
                <title>Malware campaign observed</title>
                <link>https://example.org/post/1</link>
                <description><![CDATA[<p>C2 at <b>203.0.113.5</b> &amp; friends</p>]]></description>
                <pubDate>Tue, 05 Aug 2025 10:00:00 GMT</pubDate>
            </item>
            <item>
                <title>Second post</title>
                <link>https://example.org/post/2</link>
                <description>Plain text body</description>
            </item>
        </channel></rss>"#;

    const ATOM_SAMPLE: &str = r#"<?xml version="1.0"?>
        <feed xmlns="http://www.w3.org/2005/Atom">
            <title>Atom Feed</title>
            <entry>
                <title>Advisory</title>
                <link href="https://example.org/advisory"/>
                <summary>Patch now</summary>
                <updated>2025-08-05T10:00:00Z</updated>
            </entry>
        </feed>"#;

    #[test]
    fn parses_rss_items() {
        let parser = FeedParser::new();
        let items = parser.parse(RSS_SAMPLE).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].title, "Malware campaign observed");
        assert_eq!(items[0].link.as_deref(), Some("https://example.org/post/1"));
        assert!(items[0].published.is_some());
        assert!(items[0].body().contains("203.0.113.5"));
    }

    #[test]
    fn parses_atom_entries() {
        let parser = FeedParser::new();
        let items = parser.parse(ATOM_SAMPLE).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Advisory");
        assert_eq!(items[0].link.as_deref(), Some("https://example.org/advisory"));
        assert_eq!(items[0].body(), "Patch now");
    }

    #[test]
    fn channel_title_is_not_an_item() {
        let parser = FeedParser::new();
        let items = parser.parse(RSS_SAMPLE).unwrap();
        assert!(items.iter().all(|i| i.title != "Feed Title"));
    }

    #[test]
    fn malformed_xml_is_an_error() {
        let parser = FeedParser::new();
        assert!(parser.parse("<rss><channel><item></rss>").is_err());
    }

    #[test]
    fn empty_feed_is_ok() {
        let parser = FeedParser::new();
        let items = parser
            .parse(r#"<rss version="2.0"><channel><title>x</title></channel></rss>"#)
            .unwrap();
        assert!(items.is_empty());
    }

    #[test]
    fn clean_html_strips_markup() {
        let parser = FeedParser::new();
        let cleaned = parser.clean_html("<p>C2 at  <b>203.0.113.5</b> &amp; friends</p>");
        assert_eq!(cleaned, "C2 at 203.0.113.5 & friends");
    }
}
