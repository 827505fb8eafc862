use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::error::Result;
use crate::record::{CleanRecord, Endpoint, FieldValue, ITEM_SEQ};
use crate::settings::Settings;
use crate::writer::{load_output, write_json_atomic};

/// Fields both endpoints carry. The approval's value wins unless it is empty.
const APPROVAL_PRECEDENCE: &[&str] = &["ITEM_NAME", "ENTP_NAME", "CHART"];

const SOURCE: &str = "_source";
const MATCH_TYPE: &str = "_matchType";
const NEEDS_INFO: &str = "_needsAdditionalInfo";
const EXACT_MATCH: &str = "exact_match_by_ITEM_SEQ";

pub type JsonRecord = Map<String, Value>;

#[derive(Debug, Default)]
pub struct MergeResult {
    pub merged: Vec<JsonRecord>,
    pub unmatched_pills: Vec<JsonRecord>,
    pub unmatched_approvals: Vec<JsonRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeAnalysis {
    pub total_items: usize,
    pub total_merged: usize,
    pub total_unmatched_pills: usize,
    pub total_unmatched_approvals: usize,
    /// Percent of all items that were matched, rounded to 2 decimals.
    pub match_rate: f64,
}

impl fmt::Display for MergeAnalysis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} items: {} merged, {} pill-only, {} approval-only ({:.2}% matched)",
            self.total_items,
            self.total_merged,
            self.total_unmatched_pills,
            self.total_unmatched_approvals,
            self.match_rate
        )
    }
}

pub struct MergePaths {
    pub merged: PathBuf,
    pub unmatched_pills: PathBuf,
    pub unmatched_approvals: PathBuf,
}

impl MergePaths {
    pub fn new(settings: &Settings) -> Self {
        let dir = settings.output_dir.join("merged");
        MergePaths {
            merged: dir.join("merged_drug_data.json"),
            unmatched_pills: dir.join("unmatched_pills.json"),
            unmatched_approvals: dir.join("unmatched_approvals.json"),
        }
    }
}

/// Load both collected outputs, join them on `ITEM_SEQ` and write the three
/// result files.
pub fn run(settings: &Settings) -> Result<MergeAnalysis> {
    let approvals = validate(load_output(settings, Endpoint::Approval)?, Endpoint::Approval);
    let pills = validate(load_output(settings, Endpoint::Pill)?, Endpoint::Pill);

    let result = merge(&approvals, &pills);
    let analysis = analyze(&result);

    let paths = MergePaths::new(settings);
    write_json_atomic(&paths.merged, &result.merged)?;
    write_json_atomic(&paths.unmatched_pills, &result.unmatched_pills)?;
    write_json_atomic(&paths.unmatched_approvals, &result.unmatched_approvals)?;
    info!("Merge written to {}", paths.merged.display());
    if analysis.total_unmatched_pills > 0 {
        warn!("{} pills have no approval record", analysis.total_unmatched_pills);
    }
    Ok(analysis)
}

/// Drop records without an `ITEM_SEQ` and repeated ones (first wins).
/// Identifiers become text and the shared name fields are trimmed.
pub fn validate(records: Vec<CleanRecord>, endpoint: Endpoint) -> Vec<CleanRecord> {
    let mut seen = HashSet::new();
    let mut kept = Vec::with_capacity(records.len());
    let (mut missing, mut duplicate) = (0usize, 0usize);

    for mut record in records {
        let seq = record
            .get(ITEM_SEQ)
            .map(|v| v.to_string().trim().to_string())
            .unwrap_or_default();
        if seq.is_empty() {
            missing += 1;
            continue;
        }
        if !seen.insert(seq.clone()) {
            duplicate += 1;
            continue;
        }
        for field in APPROVAL_PRECEDENCE {
            let trimmed = record.text(field).trim().to_string();
            if record.get(field).map_or(true, |v| v.as_text().is_some()) {
                record.insert(*field, trimmed);
            }
        }
        record.insert(ITEM_SEQ, seq);
        kept.push(record);
    }

    if missing > 0 || duplicate > 0 {
        warn!(
            "{}: dropped {} records without ITEM_SEQ and {} duplicates",
            endpoint, missing, duplicate
        );
    }
    info!("{}: {} valid records", endpoint, kept.len());
    kept
}

pub fn merge(approvals: &[CleanRecord], pills: &[CleanRecord]) -> MergeResult {
    let by_seq: HashMap<&str, &CleanRecord> = approvals.iter().map(|a| (a.item_seq(), a)).collect();
    let empty = FieldValue::Text(String::new());
    let mut matched = HashSet::new();
    let mut result = MergeResult::default();

    for pill in pills {
        match by_seq.get(pill.item_seq()) {
            Some(approval) => {
                let mut merged = to_json(approval);
                merged.extend(to_json(pill));
                for field in APPROVAL_PRECEDENCE {
                    let winner = match approval.get(field) {
                        Some(v) if !v.is_empty() => v,
                        _ => pill.get(field).unwrap_or(&empty),
                    };
                    merged.insert(field.to_string(), json_value(winner));
                }
                merged.insert(SOURCE.into(), Value::from("both"));
                merged.insert(MATCH_TYPE.into(), Value::from(EXACT_MATCH));
                result.merged.push(merged);
                matched.insert(pill.item_seq());
            }
            None => {
                let mut unmatched = to_json(pill);
                unmatched.insert(NEEDS_INFO.into(), Value::Bool(true));
                unmatched.insert(SOURCE.into(), Value::from("pill_only"));
                result.unmatched_pills.push(unmatched);
            }
        }
    }

    for approval in approvals {
        if !matched.contains(approval.item_seq()) {
            let mut unmatched = to_json(approval);
            unmatched.insert(SOURCE.into(), Value::from("approval_only"));
            result.unmatched_approvals.push(unmatched);
        }
    }
    result
}

pub fn analyze(result: &MergeResult) -> MergeAnalysis {
    let total_merged = result.merged.len();
    let total_unmatched_pills = result.unmatched_pills.len();
    let total_unmatched_approvals = result.unmatched_approvals.len();
    let total_items = total_merged + total_unmatched_pills + total_unmatched_approvals;
    let match_rate = if total_items > 0 {
        (total_merged as f64 / total_items as f64 * 10_000.0).round() / 100.0
    } else {
        0.0
    };
    MergeAnalysis {
        total_items,
        total_merged,
        total_unmatched_pills,
        total_unmatched_approvals,
        match_rate,
    }
}

fn to_json(record: &CleanRecord) -> JsonRecord {
    record
        .fields()
        .map(|(k, v)| (k.to_string(), json_value(v)))
        .collect()
}

fn json_value(value: &FieldValue) -> Value {
    match value {
        FieldValue::Integer(n) => Value::from(*n),
        FieldValue::Decimal(n) => serde_json::Number::from_f64(*n).map_or(Value::Null, Value::Number),
        FieldValue::Text(s) => Value::String(s.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(pairs: &[(&str, &str)]) -> CleanRecord {
        let mut r = CleanRecord::new();
        for (k, v) in pairs {
            r.insert(*k, *v);
        }
        r
    }

    #[test]
    fn approval_fields_take_precedence() {
        let approvals = vec![rec(&[
            ("ITEM_SEQ", "1"),
            ("ITEM_NAME", "타이레놀정500밀리그람"),
            ("ENTP_NAME", ""),
            ("CHART", "흰색 정제"),
            ("EE_DOC_DATA", "【효능효과】"),
        ])];
        let pills = vec![rec(&[
            ("ITEM_SEQ", "1"),
            ("ITEM_NAME", "타이레놀정"),
            ("ENTP_NAME", "(주)한국얀센"),
            ("CHART", "흰색의 장방형"),
            ("PRINT_FRONT", "TYLENOL"),
        ])];

        let result = merge(&approvals, &pills);
        assert_eq!(result.merged.len(), 1);
        let m = &result.merged[0];
        assert_eq!(m["ITEM_NAME"], "타이레놀정500밀리그람");
        assert_eq!(m["ENTP_NAME"], "(주)한국얀센");
        assert_eq!(m["CHART"], "흰색 정제");
        assert_eq!(m["PRINT_FRONT"], "TYLENOL");
        assert_eq!(m["EE_DOC_DATA"], "【효능효과】");
        assert_eq!(m["_source"], "both");
        assert_eq!(m["_matchType"], "exact_match_by_ITEM_SEQ");
    }

    #[test]
    fn unmatched_are_tagged() {
        let approvals = vec![rec(&[("ITEM_SEQ", "1")]), rec(&[("ITEM_SEQ", "2")])];
        let pills = vec![rec(&[("ITEM_SEQ", "2")]), rec(&[("ITEM_SEQ", "3")])];
        let result = merge(&approvals, &pills);

        assert_eq!(result.unmatched_pills.len(), 1);
        assert_eq!(result.unmatched_pills[0]["ITEM_SEQ"], "3");
        assert_eq!(result.unmatched_pills[0]["_needsAdditionalInfo"], true);
        assert_eq!(result.unmatched_pills[0]["_source"], "pill_only");
        assert_eq!(result.unmatched_approvals.len(), 1);
        assert_eq!(result.unmatched_approvals[0]["_source"], "approval_only");

        let a = analyze(&result);
        assert_eq!((a.total_items, a.total_merged), (3, 1));
        assert_eq!(a.match_rate, 33.33);
    }

    #[test]
    fn empty_inputs_have_zero_rate() {
        let a = analyze(&merge(&[], &[]));
        assert_eq!(a.total_items, 0);
        assert_eq!(a.match_rate, 0.0);
    }

    #[test]
    fn validate_drops_missing_and_duplicates() {
        let mut numeric = CleanRecord::new();
        numeric.insert("ITEM_SEQ", FieldValue::Integer(42));
        let records = vec![
            rec(&[("ITEM_SEQ", "1"), ("ITEM_NAME", "  가스디알정 ")]),
            rec(&[("ITEM_NAME", "no id")]),
            rec(&[("ITEM_SEQ", "")]),
            rec(&[("ITEM_SEQ", "1"), ("ITEM_NAME", "second")]),
            numeric,
        ];
        let kept = validate(records, Endpoint::Pill);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].text("ITEM_NAME"), "가스디알정");
        assert_eq!(kept[1].item_seq(), "42");
    }

    #[test]
    fn run_writes_three_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::with_api_key("k");
        settings.output_dir = dir.path().to_path_buf();
        write_json_atomic(
            &settings.json_path(Endpoint::Approval),
            &vec![rec(&[("ITEM_SEQ", "1")]), rec(&[("ITEM_SEQ", "2")])],
        )
        .unwrap();
        write_json_atomic(&settings.json_path(Endpoint::Pill), &vec![rec(&[("ITEM_SEQ", "1")])]).unwrap();

        let analysis = run(&settings).unwrap();
        assert_eq!(analysis.total_merged, 1);
        assert_eq!(analysis.match_rate, 50.0);

        let paths = MergePaths::new(&settings);
        let merged: Vec<JsonRecord> =
            serde_json::from_str(&std::fs::read_to_string(&paths.merged).unwrap()).unwrap();
        assert_eq!(merged.len(), 1);
        assert!(paths.unmatched_pills.exists());
        assert!(paths.unmatched_approvals.exists());
    }
}
