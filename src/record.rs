use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier field shared by both upstream services.
pub const ITEM_SEQ: &str = "ITEM_SEQ";

const APPROVAL_FIELDS: &[&str] = &[
    "ITEM_SEQ",
    "ITEM_NAME",
    "ENTP_NAME",
    "ETC_OTC_CODE",
    "ETC_OTC_NAME",
    "CHART",
    "EE_DOC_DATA",
    "UD_DOC_DATA",
    "NB_DOC_DATA",
    "STORAGE_METHOD",
    "VALID_TERM",
    "CANCEL_DATE",
];

const PILL_FIELDS: &[&str] = &[
    "ITEM_SEQ",
    "ITEM_NAME",
    "ENTP_SEQ",
    "ENTP_NAME",
    "CHART",
    "ITEM_IMAGE",
    "PRINT_FRONT",
    "PRINT_BACK",
    "DRUG_SHAPE",
    "COLOR_CLASS1",
    "COLOR_CLASS2",
    "LENG_LONG",
    "LENG_SHORT",
    "THICK",
    "CLASS_NO",
    "CLASS_NAME",
    "ETC_OTC_NAME",
    "FORM_CODE_NAME",
    "MARK_CODE_FRONT_ANAL",
    "MARK_CODE_BACK_ANAL",
];

/// The two MFDS open-data services the collector knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum Endpoint {
    /// Product approval details (DrugPrdtPrmsnInfoService06).
    Approval,
    /// Tablet/capsule visual identification (MdcinGrnIdntfcInfoService01).
    Pill,
}

impl Endpoint {
    pub const ALL: [Endpoint; 2] = [Endpoint::Approval, Endpoint::Pill];

    pub fn default_url(self) -> &'static str {
        match self {
            Endpoint::Approval => {
                "http://apis.data.go.kr/1471000/DrugPrdtPrmsnInfoService06/getDrugPrdtPrmsnDtlInq05"
            }
            Endpoint::Pill => {
                "http://apis.data.go.kr/1471000/MdcinGrnIdntfcInfoService01/getMdcinGrnIdntfcInfoList01"
            }
        }
    }

    /// Fields kept from each `<item>`. `ITEM_SEQ` comes first.
    pub fn fields(self) -> &'static [&'static str] {
        match self {
            Endpoint::Approval => APPROVAL_FIELDS,
            Endpoint::Pill => PILL_FIELDS,
        }
    }

    pub fn numeric_fields(self) -> &'static [&'static str] {
        match self {
            Endpoint::Approval => &[],
            Endpoint::Pill => &["LENG_LONG", "LENG_SHORT", "THICK"],
        }
    }

    /// Fields holding an embedded DOC/SECTION/ARTICLE/PARAGRAPH document.
    pub fn document_fields(self) -> &'static [&'static str] {
        match self {
            Endpoint::Approval => &["EE_DOC_DATA", "UD_DOC_DATA", "NB_DOC_DATA"],
            Endpoint::Pill => &[],
        }
    }

    /// Shared by the SQLite table and the JSON file stem.
    pub fn table_name(self) -> &'static str {
        match self {
            Endpoint::Approval => "drug_approvals",
            Endpoint::Pill => "pill_identifications",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Approval => f.write_str("approval"),
            Endpoint::Pill => f.write_str("pill"),
        }
    }
}

/// One `<item>` fragment exactly as the API returned it.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub endpoint: Endpoint,
    pub xml: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Integer(i64),
    Decimal(f64),
    Text(String),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, FieldValue::Text(s) if s.is_empty())
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Integer(n) => write!(f, "{}", n),
            FieldValue::Decimal(n) => write!(f, "{}", n),
            FieldValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl rusqlite::ToSql for FieldValue {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        use rusqlite::types::{ToSqlOutput, ValueRef};
        Ok(match self {
            FieldValue::Integer(n) => ToSqlOutput::Borrowed(ValueRef::Integer(*n)),
            FieldValue::Decimal(n) => ToSqlOutput::Borrowed(ValueRef::Real(*n)),
            FieldValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

/// A record with all markup removed, keyed by upstream field name. Keys are
/// kept sorted by name, so stored JSON objects list fields alphabetically.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CleanRecord {
    fields: BTreeMap<String, FieldValue>,
}

impl CleanRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    /// Text value of `key`, or "" when absent or numeric.
    pub fn text(&self, key: &str) -> &str {
        self.get(key).and_then(FieldValue::as_text).unwrap_or("")
    }

    pub fn item_seq(&self) -> &str {
        self.text(ITEM_SEQ)
    }

    /// Fields sorted by name.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.fields.len()
    }
}
