use std::collections::HashSet;

use crate::record::{CleanRecord, Endpoint};

const EXPORT_ONLY_MARKER: &str = "(수출용)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Keep,
    /// Approval withdrawn (`CANCEL_DATE` set).
    Cancelled,
    /// Manufactured for export only.
    ExportOnly,
    /// `ITEM_SEQ` already seen earlier in this run.
    Duplicate,
}

/// Decides which cleaned records are written. Remembers every identifier it
/// was shown, admitted or not, so one filter is used per run and endpoint.
#[derive(Debug)]
pub struct RecordFilter {
    endpoint: Endpoint,
    seen: HashSet<String>,
}

impl RecordFilter {
    pub fn new(endpoint: Endpoint) -> Self {
        RecordFilter {
            endpoint,
            seen: HashSet::new(),
        }
    }

    pub fn admit(&mut self, record: &CleanRecord) -> Admission {
        if !self.seen.insert(record.item_seq().to_string()) {
            return Admission::Duplicate;
        }
        if self.endpoint == Endpoint::Approval {
            if !record.text("CANCEL_DATE").is_empty() {
                return Admission::Cancelled;
            }
            if record.text("ITEM_NAME").contains(EXPORT_ONLY_MARKER) {
                return Admission::ExportOnly;
            }
        }
        Admission::Keep
    }

    /// True when none of `ids` is new. A page like that means the service is
    /// handing back pages it already served.
    pub fn all_seen<'a>(&self, mut ids: impl Iterator<Item = &'a str>) -> bool {
        ids.all(|id| self.seen.contains(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(seq: &str, name: &str, cancel: &str) -> CleanRecord {
        let mut r = CleanRecord::new();
        r.insert("ITEM_SEQ", seq);
        r.insert("ITEM_NAME", name);
        r.insert("CANCEL_DATE", cancel);
        r
    }

    #[test]
    fn approval_rules() {
        let mut f = RecordFilter::new(Endpoint::Approval);
        assert_eq!(f.admit(&rec("1", "타이레놀정", "")), Admission::Keep);
        assert_eq!(f.admit(&rec("1", "타이레놀정", "")), Admission::Duplicate);
        assert_eq!(f.admit(&rec("2", "구주염산", "20200101")), Admission::Cancelled);
        assert_eq!(f.admit(&rec("3", "네오덱스정(수출용)", "")), Admission::ExportOnly);
        assert!(f.all_seen(["1", "2"].into_iter()));
        assert!(!f.all_seen(["1", "4"].into_iter()));
    }

    #[test]
    fn pill_records_only_deduplicated() {
        let mut f = RecordFilter::new(Endpoint::Pill);
        assert_eq!(f.admit(&rec("3", "네오덱스정(수출용)", "20200101")), Admission::Keep);
        assert_eq!(f.admit(&rec("3", "x", "")), Admission::Duplicate);
    }
}
