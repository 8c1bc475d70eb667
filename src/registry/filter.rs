use crate::pm2::record::{ProcessRecord, ProcessStatus};
use serde::Serialize;

/// Status predicate. `All` is the wildcard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "status")]
pub enum StatusFilter {
    #[default]
    All,
    Only(String),
}

impl StatusFilter {
    /// `""`, `"*"` and `"all"` (any case) mean no filtering.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed == "*" || trimmed.eq_ignore_ascii_case("all") {
            StatusFilter::All
        } else {
            StatusFilter::Only(trimmed.to_string())
        }
    }

    pub fn admits(&self, status: &ProcessStatus) -> bool {
        match self {
            StatusFilter::All => true,
            StatusFilter::Only(wanted) => status.matches(wanted),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterState {
    pub search_text: String,
    pub status: StatusFilter,
}

impl FilterState {
    pub fn new(search_text: impl Into<String>, status: StatusFilter) -> Self {
        Self {
            search_text: search_text.into(),
            status,
        }
    }

    pub fn admits(&self, record: &ProcessRecord) -> bool {
        let needle = self.search_text.trim();
        let name_ok = needle.is_empty() || record.name.to_lowercase().contains(&needle.to_lowercase());
        name_ok && self.status.admits(&record.status)
    }
}

/// Both predicates, AND-ed, snapshot order preserved.
pub fn apply_filters(snapshot: &[ProcessRecord], filter: &FilterState) -> Vec<ProcessRecord> {
    snapshot.iter().filter(|r| filter.admits(r)).cloned().collect()
}
