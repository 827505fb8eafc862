pub mod document;
pub mod markup;
pub mod rules;

use quick_xml::events::Event;
use quick_xml::Reader;
use rayon::prelude::*;
use serde::Serialize;

use crate::error::{CollectError, Result};
use crate::record::{CleanRecord, Endpoint, FieldValue, RawRecord};

/// A document field that did not parse and was stored as plain text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldIssue {
    pub field: String,
    pub error: String,
}

#[derive(Debug)]
pub struct Cleaned {
    pub record: CleanRecord,
    pub issues: Vec<FieldIssue>,
}

/// Two-step transform: `<item>` fragment → (field, inner xml) pairs → clean values.
pub fn clean_record(raw: &RawRecord) -> Result<Cleaned> {
    let fields = parse_fields(&raw.xml)?;
    let endpoint = raw.endpoint;

    let mut record = CleanRecord::new();
    let mut issues = Vec::new();
    for &name in endpoint.fields() {
        let value = match fields.iter().find(|(n, _)| n == name) {
            Some((_, inner)) => {
                let (value, error) = clean_field(endpoint, name, inner)?;
                if let Some(e) = error {
                    issues.push(FieldIssue {
                        field: name.to_string(),
                        error: e.to_string(),
                    });
                }
                value
            }
            None => FieldValue::Text(String::new()),
        };
        record.insert(name, value);
    }

    if record.item_seq().is_empty() {
        return Err(CollectError::Parse(format!(
            "{} item has no ITEM_SEQ",
            endpoint
        )));
    }

    if endpoint == Endpoint::Approval && record.text("ETC_OTC_NAME").is_empty() {
        let code = record.text("ETC_OTC_CODE").to_string();
        if !code.is_empty() {
            record.insert("ETC_OTC_NAME", code);
        }
    }

    Ok(Cleaned { record, issues })
}

/// Clean a whole page in parallel. The first malformed item fails the page,
/// so nothing from it reaches the writer.
pub fn clean_page(items: &[RawRecord]) -> Result<Vec<Cleaned>> {
    items.par_iter().map(clean_record).collect()
}

/// Split an `<item>` fragment into its direct children, keeping each child's
/// inner content verbatim (CDATA, escapes and nested tags included).
pub fn parse_fields(xml: &str) -> Result<Vec<(String, String)>> {
    let mut reader = Reader::from_str(xml);
    let mut fields = Vec::new();
    let mut opened = false;
    let mut closed = false;

    loop {
        match reader.read_event()? {
            Event::Start(_) if !opened => opened = true,
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                let inner = reader.read_text(e.name())?;
                fields.push((name, inner.into_owned()));
            }
            Event::Empty(e) if opened => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                fields.push((name, String::new()));
            }
            Event::End(_) => {
                closed = true;
                break;
            }
            Event::Text(t) if opened && !t.iter().all(u8::is_ascii_whitespace) => {
                return Err(CollectError::Parse(format!(
                    "unexpected text in item: {}",
                    String::from_utf8_lossy(&t).trim()
                )));
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !opened || !closed {
        return Err(CollectError::Parse("item fragment is not a closed element".into()));
    }
    Ok(fields)
}

/// The cleaned value, plus the parse error of a document field that had to
/// fall back to plain text.
fn clean_field(endpoint: Endpoint, name: &str, inner: &str) -> Result<(FieldValue, Option<CollectError>)> {
    if endpoint.document_fields().contains(&name) {
        // Nested elements are parsed as they are; CDATA-wrapped or escaped
        // trees have to be unwrapped first.
        let source = if inner.trim_start().starts_with("<DOC") {
            inner.to_string()
        } else {
            flatten_text(inner)?
        };
        let (text, error) = if document::looks_like_document(&source) {
            document::render(&source)
        } else {
            (markup::clean_text(&source), None)
        };
        return Ok((FieldValue::Text(text), error));
    }

    let text = markup::clean_text(&flatten_text(inner)?);
    if endpoint.numeric_fields().contains(&name) {
        if let Some(n) = text.parse::<f64>().ok().filter(|n| n.is_finite()) {
            return Ok((FieldValue::Decimal(n), None));
        }
    }
    Ok((FieldValue::Text(text), None))
}

/// Concatenate the character data of a field: text with entities decoded
/// (escaped HTML and escaped DOC trees become markup again), CDATA unwrapped,
/// nested tags dropped, `<br/>` kept as a space.
fn flatten_text(inner: &str) -> Result<String> {
    let mut reader = Reader::from_str(inner);
    let mut out = String::with_capacity(inner.len());
    loop {
        match reader.read_event()? {
            Event::Text(t) => out.push_str(&markup::decode_entities(&String::from_utf8_lossy(&t))),
            Event::CData(c) => out.push_str(&String::from_utf8_lossy(&c)),
            Event::Empty(_) => out.push(' '),
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::markup::{has_cdata_marker, has_tag};
    use super::*;

    fn raw(endpoint: Endpoint, xml: &str) -> RawRecord {
        RawRecord {
            endpoint,
            xml: xml.to_string(),
        }
    }

    fn fixture(name: &str) -> String {
        std::fs::read_to_string(format!("tests/fixtures/{}.xml", name)).unwrap()
    }

    #[test]
    fn pill_item_cleaned() {
        let xml = "<item>\
            <ITEM_SEQ>200808876</ITEM_SEQ>\
            <ITEM_NAME><![CDATA[<b>가스디알정</b>50밀리그램]]></ITEM_NAME>\
            <CHART>&lt;i&gt;녹색&lt;/i&gt;의 원형 정제</CHART>\
            <LENG_LONG>8.1</LENG_LONG>\
            <THICK>-</THICK>\
            <UNLISTED>x</UNLISTED>\
            </item>";
        let rec = clean_record(&raw(Endpoint::Pill, xml)).unwrap().record;
        assert_eq!(rec.item_seq(), "200808876");
        assert_eq!(rec.text("ITEM_NAME"), "가스디알정50밀리그램");
        assert_eq!(rec.text("CHART"), "녹색의 원형 정제");
        assert_eq!(rec.get("LENG_LONG"), Some(&FieldValue::Decimal(8.1)));
        assert_eq!(rec.text("THICK"), "-");
        assert_eq!(rec.text("PRINT_FRONT"), "");
        assert!(rec.get("UNLISTED").is_none());
        assert_eq!(rec.len(), Endpoint::Pill.fields().len());
    }

    #[test]
    fn html_inside_cdata_keeps_inner_text() {
        let xml = "<item><ITEM_SEQ>1</ITEM_SEQ><ITEM_NAME><![CDATA[<i>Ibuprofen</i> 200mg]]></ITEM_NAME></item>";
        let rec = clean_record(&raw(Endpoint::Pill, xml)).unwrap().record;
        assert_eq!(rec.text("ITEM_NAME"), "Ibuprofen 200mg");
    }

    #[test]
    fn no_markup_survives_fixture() {
        for item in crate::fetcher::parse_page(Endpoint::Approval, &fixture("approval_page"))
            .unwrap()
            .items
        {
            let rec = clean_record(&item).unwrap().record;
            for (k, v) in rec.fields() {
                let s = v.to_string();
                assert!(!has_cdata_marker(&s), "{} kept CDATA: {}", k, s);
                assert!(!has_tag(&s), "{} kept a tag: {}", k, s);
            }
        }
    }

    #[test]
    fn embedded_document_rendered() {
        let page = crate::fetcher::parse_page(Endpoint::Approval, &fixture("approval_page")).unwrap();
        let cleaned = clean_record(&page.items[0]).unwrap();
        assert!(cleaned.issues.is_empty(), "{:?}", cleaned.issues);
        let rec = cleaned.record;
        let ee = rec.text("EE_DOC_DATA");
        assert!(ee.starts_with("【효능효과】"), "{}", ee);
        assert!(ee.contains("- 감기로 인한 발열 및 동통(통증)"), "{}", ee);
        let ud = rec.text("UD_DOC_DATA");
        assert!(ud.contains("■ 성인"), "{}", ud);
    }

    #[test]
    fn otc_name_falls_back_to_code() {
        let xml = "<item><ITEM_SEQ>7</ITEM_SEQ><ETC_OTC_CODE>일반의약품</ETC_OTC_CODE><ETC_OTC_NAME/></item>";
        let rec = clean_record(&raw(Endpoint::Approval, xml)).unwrap().record;
        assert_eq!(rec.text("ETC_OTC_NAME"), "일반의약품");
    }

    #[test]
    fn missing_item_seq_is_parse_error() {
        let xml = "<item><ITEM_NAME>이름</ITEM_NAME></item>";
        let err = clean_record(&raw(Endpoint::Pill, xml)).unwrap_err();
        assert!(matches!(err, CollectError::Parse(_)));
    }

    #[test]
    fn malformed_xml_is_parse_error() {
        for xml in [
            "<item><ITEM_SEQ>1</ITEM_SEQ><ITEM_NAME>abc",
            "<item><ITEM_SEQ>1</ITEM_SEQ><ITEM_NAME>a</CHART></item>",
            "<item><ITEM_SEQ>1</ITEM_SEQ><ITEM_NAME><![CDATA[open",
            "",
        ] {
            let err = clean_record(&raw(Endpoint::Pill, xml)).unwrap_err();
            assert!(matches!(err, CollectError::Parse(_)), "{:?} -> {:?}", xml, err);
        }
    }

    #[test]
    fn bad_page_yields_no_records() {
        let good = raw(Endpoint::Pill, "<item><ITEM_SEQ>1</ITEM_SEQ></item>");
        let bad = raw(Endpoint::Pill, "<item><ITEM_SEQ>2</ITEM_SEQ>");
        assert_eq!(clean_page(&[good.clone()]).unwrap().len(), 1);
        assert!(clean_page(&[good, bad]).is_err());
    }

    #[test]
    fn broken_document_is_reported() {
        let xml = "<item><ITEM_SEQ>8</ITEM_SEQ>\
            <EE_DOC_DATA><![CDATA[<DOC title=\"효능효과\"><ARTICLE title=\"1\"><PARAGRAPH>두통</ARTICLE>]]></EE_DOC_DATA>\
            <UD_DOC_DATA><![CDATA[<DOC title=\"용법용량\"><PARAGRAPH>1일 3회</PARAGRAPH></DOC>]]></UD_DOC_DATA>\
            </item>";
        let cleaned = clean_record(&raw(Endpoint::Approval, xml)).unwrap();
        assert_eq!(cleaned.issues.len(), 1);
        assert_eq!(cleaned.issues[0].field, "EE_DOC_DATA");
        assert!(!cleaned.issues[0].error.is_empty());
        assert!(cleaned.record.text("EE_DOC_DATA").contains("두통"));
        assert_eq!(cleaned.record.text("UD_DOC_DATA"), "【용법용량】\n- 1일 3회");
    }
}
