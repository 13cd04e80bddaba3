//! Incremental diff against a baseline
//!
//! An entity is processed when it is new, when its filing date moved
//! strictly forward, or when either date cannot be read.

use chrono::{NaiveDate, Utc};
use serde::Serialize;

use super::baseline::Baseline;
use crate::types::{EntityId, EntityRecord};

/// Parse an `MM/DD/YYYY` date (one- or two-digit month and day)
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let mut parts = raw.trim().split('/');
    let (month, day, year) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    if !(1..=2).contains(&month.len()) || !(1..=2).contains(&day.len()) || year.len() != 4 {
        return None;
    }
    if ![month, day, year].iter().all(|p| p.bytes().all(|b| b.is_ascii_digit())) {
        return None;
    }
    NaiveDate::from_ymd_opt(year.parse().ok()?, month.parse().ok()?, day.parse().ok()?)
}

/// Outcome of comparing one entity with the baseline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffDecision {
    New,
    /// `ambiguous` when a date was missing or unparseable
    Updated { ambiguous: bool },
    Unchanged,
}

impl DiffDecision {
    pub fn should_process(&self) -> bool {
        !matches!(self, DiffDecision::Unchanged)
    }
}

/// Counts of diff decisions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IncrementalStats {
    pub total: usize,
    pub new: usize,
    /// Includes `unparseable`
    pub updated: usize,
    pub unchanged: usize,
    pub unparseable: usize,
}

impl IncrementalStats {
    pub fn record(&mut self, decision: DiffDecision) {
        self.total += 1;
        match decision {
            DiffDecision::New => self.new += 1,
            DiffDecision::Updated { ambiguous } => {
                self.updated += 1;
                if ambiguous {
                    self.unparseable += 1;
                }
            }
            DiffDecision::Unchanged => self.unchanged += 1,
        }
    }

    pub fn selected(&self) -> usize {
        self.new + self.updated
    }
}

/// Selects new or changed entities relative to a baseline
#[derive(Debug, Clone)]
pub struct IncrementalDiffEngine {
    baseline: Baseline,
}

impl IncrementalDiffEngine {
    pub fn new(baseline: Baseline) -> Self {
        Self { baseline }
    }

    pub fn baseline(&self) -> &Baseline {
        &self.baseline
    }

    /// Decide for one record
    pub fn decide(&self, id: &str, filing_date: Option<&str>) -> DiffDecision {
        let Some(baseline_raw) = self.baseline.date_of(id) else {
            return DiffDecision::New;
        };

        let current = filing_date.and_then(|raw| {
            let parsed = parse_date(raw);
            if parsed.is_none() {
                tracing::warn!(entity = %id, "Unparseable current filing date {:?}", raw);
            }
            parsed
        });
        if filing_date.is_none() {
            tracing::warn!(entity = %id, "Missing current filing date");
        }

        let prior = parse_date(baseline_raw);
        if prior.is_none() {
            tracing::warn!(entity = %id, "Unparseable baseline filing date {:?}", baseline_raw);
        }

        match (current, prior) {
            (Some(current), Some(prior)) if current > prior => DiffDecision::Updated { ambiguous: false },
            (Some(_), Some(_)) => DiffDecision::Unchanged,
            _ => DiffDecision::Updated { ambiguous: true },
        }
    }

    /// Ids to process, in input order, plus the decision counts
    pub fn select_for_processing(&self, current: &[EntityRecord]) -> (Vec<EntityId>, IncrementalStats) {
        let mut stats = IncrementalStats::default();
        let mut selected = Vec::new();

        for record in current {
            let decision = self.decide(&record.id, record.filing_date.as_deref());
            stats.record(decision);
            if decision.should_process() {
                selected.push(record.id.clone());
            }
        }

        tracing::info!(
            "Incremental diff: {} new, {} updated, {} unchanged ({} with unreadable dates)",
            stats.new,
            stats.updated,
            stats.unchanged,
            stats.unparseable
        );
        (selected, stats)
    }
}

/// Derives run file names from a base name and a date token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputNaming {
    token: String,
    incremental: bool,
}

impl OutputNaming {
    pub fn new(token: impl Into<String>, incremental: bool) -> Self {
        Self {
            token: token.into(),
            incremental,
        }
    }

    /// Token from today's UTC date
    pub fn today(incremental: bool) -> Self {
        Self::new(Utc::now().format("%Y%m%d").to_string(), incremental)
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn is_incremental(&self) -> bool {
        self.incremental
    }

    /// `<base>_<token>` with `_incremental` appended for incremental runs
    pub fn stem(&self, base: &str) -> String {
        if self.incremental {
            format!("{}_{}_incremental", base, self.token)
        } else {
            format!("{}_{}", base, self.token)
        }
    }

    pub fn csv(&self, base: &str) -> String {
        format!("{}.csv", self.stem(base))
    }

    pub fn summary(&self, base: &str) -> String {
        format!("{}_summary.json", self.stem(base))
    }
}
