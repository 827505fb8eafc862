//! Embedded label documents (`EE_DOC_DATA`, `UD_DOC_DATA`, `NB_DOC_DATA`).
//!
//! The approval service ships efficacy, dosage and precaution texts as a small
//! XML tree:
//!
//! ```text
//! <DOC title="효능효과" type="EE">
//!   <SECTION title="">
//!     <ARTICLE title="1. 주효능">
//!       <PARAGRAPH tagName="p"><![CDATA[두통, 치통 ...]]></PARAGRAPH>
//! ```
//!
//! which is rendered to plain text as
//!
//! ```text
//! 【효능효과】
//!
//! ■ 1. 주효능
//! - 두통, 치통 ...
//! ```

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::markup::{clean_text, decode_entities, is_block_tag};
use crate::error::{CollectError, Result};

#[derive(Debug, Default, PartialEq)]
pub struct Document {
    pub title: String,
    pub articles: Vec<Article>,
}

#[derive(Debug, Default, PartialEq)]
pub struct Article {
    pub title: String,
    pub paragraphs: Vec<String>,
}

/// True when `source` carries a DOC tree rather than plain text.
pub fn looks_like_document(source: &str) -> bool {
    source.contains("<DOC")
}

/// Render an embedded document. A document that does not parse degrades to
/// tag-stripped text instead of failing the whole record; the parse error is
/// returned next to the text so the caller can report it.
pub fn render(source: &str) -> (String, Option<CollectError>) {
    let start = source.find("<DOC").unwrap_or(0);
    match parse(&source[start..]) {
        Ok(doc) => (doc.to_text(), None),
        Err(e) => (clean_text(source), Some(e)),
    }
}

pub fn parse(xml: &str) -> Result<Document> {
    let mut reader = Reader::from_str(xml);
    let mut doc = Document::default();
    let mut paragraph: Option<String> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.name().as_ref() {
                b"DOC" => doc.title = title_attr(&e),
                b"ARTICLE" => doc.articles.push(Article {
                    title: title_attr(&e),
                    paragraphs: Vec::new(),
                }),
                b"PARAGRAPH" => paragraph = Some(String::new()),
                name if separates_words(name) => push_space(&mut paragraph),
                _ => {}
            },
            Event::Empty(e) => match e.name().as_ref() {
                b"ARTICLE" => doc.articles.push(Article {
                    title: title_attr(&e),
                    paragraphs: Vec::new(),
                }),
                name if separates_words(name) => push_space(&mut paragraph),
                _ => {}
            },
            Event::Text(t) => {
                if let Some(p) = paragraph.as_mut() {
                    p.push_str(&String::from_utf8_lossy(&t));
                }
            }
            Event::CData(c) => {
                if let Some(p) = paragraph.as_mut() {
                    p.push_str(&String::from_utf8_lossy(&c));
                }
            }
            Event::End(e) if e.name().as_ref() == b"PARAGRAPH" => {
                if let Some(raw) = paragraph.take() {
                    let text = clean_text(&raw);
                    if !text.is_empty() {
                        if doc.articles.is_empty() {
                            doc.articles.push(Article::default());
                        }
                        if let Some(article) = doc.articles.last_mut() {
                            article.paragraphs.push(text);
                        }
                    }
                }
            }
            Event::End(e) if separates_words(e.name().as_ref()) => push_space(&mut paragraph),
            Event::Eof => break,
            _ => {}
        }
    }

    doc.articles
        .retain(|a| !a.title.is_empty() || !a.paragraphs.is_empty());
    Ok(doc)
}

fn separates_words(name: &[u8]) -> bool {
    std::str::from_utf8(name).is_ok_and(is_block_tag)
}

fn push_space(paragraph: &mut Option<String>) {
    if let Some(p) = paragraph.as_mut() {
        p.push(' ');
    }
}

fn title_attr(e: &BytesStart) -> String {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == b"title")
        .map(|a| clean_text(&decode_entities(&String::from_utf8_lossy(&a.value))))
        .unwrap_or_default()
}

impl Document {
    pub fn to_text(&self) -> String {
        let mut lines = Vec::new();
        if !self.title.is_empty() {
            lines.push(format!("【{}】", self.title));
        }
        for article in &self.articles {
            if !article.title.is_empty() {
                lines.push(String::new());
                lines.push(format!("■ {}", article.title));
            }
            for p in &article.paragraphs {
                lines.push(format!("- {}", p));
            }
        }
        lines.join("\n").trim().to_string()
    }
}
