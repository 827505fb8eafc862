use std::borrow::Cow;
use std::sync::LazyLock;

use markup5ever::data::NAMED_ENTITIES;
use regex::{Captures, Regex};

static CDATA_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<!\[CDATA\[(.*?)\]\]>").unwrap());
/// Comments, Word conditional blocks (`<![if ...]>`), declarations such as
/// `<!DOCTYPE>`, processing instructions and ordinary tags. Group 1 is the
/// element name.
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?s)<!--.*?-->|<!\[[^\[\]<>]*\]>|<![A-Za-z][^<>]*>|<\?.*?\?>|</?([A-Za-z][A-Za-z0-9]*)\b[^<>]*>",
    )
    .unwrap()
});
static ENTITY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&(#[0-9]{1,7}|#[xX][0-9a-fA-F]{1,6}|[A-Za-z][A-Za-z0-9]{1,31});").unwrap());

const CDATA_OPEN: &str = "<![CDATA[";
const CDATA_CLOSE: &str = "]]>";

/// Tags that separate words when removed.
const BLOCK_TAGS: &[&str] = &[
    "br", "p", "div", "li", "ul", "ol", "tr", "td", "th", "table", "tbody", "thead", "h1", "h2",
    "h3", "h4", "h5", "h6",
];

/// Remove CDATA wrappers, HTML tags and entities until nothing changes.
/// Every pass that changes the text makes it strictly shorter, so this ends,
/// and the result can contain neither a CDATA marker nor a tag even when
/// decoding an entity would have produced one.
pub fn strip_markup(text: &str) -> String {
    let mut current = text.to_string();
    loop {
        let next = strip_once(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

fn strip_once(text: &str) -> String {
    let unwrapped = CDATA_RE.replace_all(text, "$1");
    let unwrapped = unwrapped.replace(CDATA_OPEN, "").replace(CDATA_CLOSE, "");
    let untagged = TAG_RE.replace_all(&unwrapped, |caps: &Captures| match caps.get(1) {
        Some(name) if is_block_tag(name.as_str()) => " ",
        _ => "",
    });
    decode_entities(&untagged).into_owned()
}

pub(crate) fn is_block_tag(name: &str) -> bool {
    BLOCK_TAGS.iter().any(|t| t.eq_ignore_ascii_case(name))
}

/// Decode HTML5 named and numeric character references. Unknown names are
/// left as they are.
pub fn decode_entities(text: &str) -> Cow<'_, str> {
    ENTITY_RE.replace_all(text, |caps: &Captures| {
        let name = &caps[1];
        let decoded = match name.strip_prefix('#') {
            Some(number) => decode_char_ref(number).map(String::from),
            None => decode_named(name),
        };
        decoded.unwrap_or_else(|| caps[0].to_string())
    })
}

/// Look a name up in the HTML5 entity table. Some names expand to two
/// code points.
fn decode_named(name: &str) -> Option<String> {
    let &(first, second) = NAMED_ENTITIES.get(format!("{};", name).as_str())?;
    if first == 0 {
        return None;
    }
    let mut out = String::new();
    out.push(char::from_u32(first)?);
    if second != 0 {
        out.push(char::from_u32(second)?);
    }
    Some(out)
}

fn decode_char_ref(number: &str) -> Option<char> {
    let code = match number.strip_prefix(['x', 'X']) {
        Some(hex) => u32::from_str_radix(hex, 16).ok()?,
        None => number.parse::<u32>().ok()?,
    };
    char::from_u32(code).filter(|c| *c != '\0')
}

/// Collapse every whitespace run (including NBSP and newlines) to one space.
pub fn normalize_ws(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_space = false;
    for ch in s.chars() {
        if ch.is_whitespace() {
            if !prev_space {
                out.push(' ');
                prev_space = true;
            }
        } else {
            out.push(ch);
            prev_space = false;
        }
    }
    out.trim().to_string()
}

/// Full cleanup for a single-line value.
pub fn clean_text(raw: &str) -> String {
    normalize_ws(&strip_markup(raw))
}

#[cfg(test)]
pub fn has_cdata_marker(s: &str) -> bool {
    s.contains(CDATA_OPEN) || s.contains(CDATA_CLOSE)
}

#[cfg(test)]
static LEFTOVER_TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[!?/A-Za-z][^<>]*>").unwrap());

/// Anything that still looks like markup. Kept independent of `TAG_RE`.
#[cfg(test)]
pub fn has_tag(s: &str) -> bool {
    LEFTOVER_TAG_RE.is_match(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bold_name() {
        assert_eq!(clean_text("<b>Aspirin</b>"), "Aspirin");
    }

    #[test]
    fn inline_tag_keeps_spacing() {
        assert_eq!(clean_text("<i>Ibuprofen</i> 200mg"), "Ibuprofen 200mg");
        assert_eq!(clean_text("H<sub>2</sub>O"), "H2O");
    }

    #[test]
    fn block_tags_separate_words() {
        assert_eq!(clean_text("one<br>two<br/>three"), "one two three");
        assert_eq!(clean_text("<table><tr><td>a</td><td>b</td></tr></table>"), "a b");
    }

    #[test]
    fn cdata_unwrapped() {
        assert_eq!(clean_text("<![CDATA[흰색의 원형 정제]]>"), "흰색의 원형 정제");
        assert_eq!(clean_text("x ]]> y <![CDATA[ z"), "x y z");
    }

    #[test]
    fn entities_decoded() {
        assert_eq!(clean_text("A&amp;B&nbsp;&#52;&#x35;"), "A&B 45");
        assert_eq!(clean_text("&unknown; stays"), "&unknown; stays");
        assert_eq!(clean_text("&#0; &#xD800;"), "&#0; &#xD800;");
    }

    #[test]
    fn html5_entities_decoded() {
        assert_eq!(
            clean_text("10&mu;g, &alpha;-토코페롤, &rarr; 참조, &beta;"),
            "10μg, α-토코페롤, → 참조, β"
        );
        assert_eq!(clean_text("5&micro;m &le; 7&deg;C &Omega;"), "5µm ≤ 7°C Ω");
        assert_eq!(clean_text("&NotEqualTilde;"), "\u{2242}\u{338}");
    }

    #[test]
    fn declarations_and_conditionals_removed() {
        let out = clean_text("<![if !supportLists]>1.<![endif]> 복용 <!DOCTYPE html><?xml version=\"1.0\"?>");
        assert_eq!(out, "1. 복용");
        assert!(!has_tag(&out));
    }

    #[test]
    fn leftover_check_sees_every_markup_kind() {
        for s in ["<![endif]>", "<!DOCTYPE html>", "<?php ?>", "</p>", "<b>"] {
            assert!(has_tag(s), "{}", s);
        }
        assert!(!has_tag("a < b > c"));
    }

    #[test]
    fn escaped_markup_cannot_survive() {
        let out = clean_text("&lt;b&gt;bold&lt;/b&gt; &lt;![CDATA[x]]&gt; <<b>b>");
        assert!(!has_tag(&out), "{}", out);
        assert!(!has_cdata_marker(&out), "{}", out);
        assert!(out.contains("bold"));
    }

    #[test]
    fn lone_angle_brackets_are_text() {
        assert_eq!(clean_text("pH < 7 and > 3"), "pH < 7 and > 3");
    }

    #[test]
    fn comments_removed() {
        assert_eq!(clean_text("a<!-- note -->b"), "ab");
    }

    #[test]
    fn whitespace_collapsed() {
        assert_eq!(normalize_ws("  a\r\n\tb \u{a0} c  "), "a b c");
    }
}
