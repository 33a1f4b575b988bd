//! Report keys, statistics, and signed report updates.
//!
//! A report key identifies one aggregate row in `sz_dm_report`. Stringified
//! keys follow the grammar:
//!
//! ```text
//! DSS|<source>|<source>|<STATISTIC>
//! CSS|<source1>|<source2>|<STATISTIC>
//! ESB|<bucket>
//! ERB|<bucket>
//! ```

use crate::types::entity::{EntityId, MatchType};
use std::fmt;
use thiserror::Error;

/// Statistic dimension of a data-source or cross-source report key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SourceStatistic {
    EntityCount,
    RecordCount,
    MatchedCount,
    UnmatchedCount,
    AmbiguousMatchCount,
    PossibleMatchCount,
    DisclosedRelationCount,
    PossibleRelationCount,
}

impl SourceStatistic {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceStatistic::EntityCount => "ENTITY_COUNT",
            SourceStatistic::RecordCount => "RECORD_COUNT",
            SourceStatistic::MatchedCount => "MATCHED_COUNT",
            SourceStatistic::UnmatchedCount => "UNMATCHED_COUNT",
            SourceStatistic::AmbiguousMatchCount => "AMBIGUOUS_MATCH_COUNT",
            SourceStatistic::PossibleMatchCount => "POSSIBLE_MATCH_COUNT",
            SourceStatistic::DisclosedRelationCount => "DISCLOSED_RELATION_COUNT",
            SourceStatistic::PossibleRelationCount => "POSSIBLE_RELATION_COUNT",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ENTITY_COUNT" => Some(SourceStatistic::EntityCount),
            "RECORD_COUNT" => Some(SourceStatistic::RecordCount),
            "MATCHED_COUNT" => Some(SourceStatistic::MatchedCount),
            "UNMATCHED_COUNT" => Some(SourceStatistic::UnmatchedCount),
            "AMBIGUOUS_MATCH_COUNT" => Some(SourceStatistic::AmbiguousMatchCount),
            "POSSIBLE_MATCH_COUNT" => Some(SourceStatistic::PossibleMatchCount),
            "DISCLOSED_RELATION_COUNT" => Some(SourceStatistic::DisclosedRelationCount),
            "POSSIBLE_RELATION_COUNT" => Some(SourceStatistic::PossibleRelationCount),
            _ => None,
        }
    }

    /// The cross-source statistic tracking relationships of a match type.
    pub fn for_match_type(match_type: MatchType) -> Self {
        match match_type {
            MatchType::AmbiguousMatch => SourceStatistic::AmbiguousMatchCount,
            MatchType::PossibleMatch => SourceStatistic::PossibleMatchCount,
            MatchType::DisclosedRelation => SourceStatistic::DisclosedRelationCount,
            MatchType::PossibleRelation => SourceStatistic::PossibleRelationCount,
        }
    }
}

impl fmt::Display for SourceStatistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of one aggregate report row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReportKey {
    DataSourceSummary {
        data_source: String,
        statistic: SourceStatistic,
    },
    CrossSourceSummary {
        source: String,
        versus: String,
        statistic: SourceStatistic,
    },
    EntitySizeBreakdown {
        bucket: i64,
    },
    EntityRelationBreakdown {
        bucket: i64,
    },
}

/// Malformed stringified report key.
#[derive(Debug, Error)]
pub enum ReportKeyError {
    #[error("empty report key")]
    Empty,
    #[error("unknown report code: {0}")]
    UnknownCode(String),
    #[error("report key {key} expects {expected} segments, found {found}")]
    SegmentCount {
        key: String,
        expected: usize,
        found: usize,
    },
    #[error("unknown statistic in report key: {0}")]
    UnknownStatistic(String),
    #[error("invalid bucket in report key: {0}")]
    InvalidBucket(String),
}

impl ReportKey {
    pub fn dss(data_source: impl Into<String>, statistic: SourceStatistic) -> Self {
        ReportKey::DataSourceSummary {
            data_source: data_source.into(),
            statistic,
        }
    }

    pub fn css(
        source: impl Into<String>,
        versus: impl Into<String>,
        statistic: SourceStatistic,
    ) -> Self {
        ReportKey::CrossSourceSummary {
            source: source.into(),
            versus: versus.into(),
            statistic,
        }
    }

    pub fn esb(bucket: i64) -> Self {
        ReportKey::EntitySizeBreakdown { bucket }
    }

    pub fn erb(bucket: i64) -> Self {
        ReportKey::EntityRelationBreakdown { bucket }
    }

    /// Two-letter report code, the first segment of the stringified key.
    pub fn code(&self) -> &'static str {
        match self {
            ReportKey::DataSourceSummary { .. } => "DSS",
            ReportKey::CrossSourceSummary { .. } => "CSS",
            ReportKey::EntitySizeBreakdown { .. } => "ESB",
            ReportKey::EntityRelationBreakdown { .. } => "ERB",
        }
    }

    pub fn parse(value: &str) -> Result<Self, ReportKeyError> {
        if value.is_empty() {
            return Err(ReportKeyError::Empty);
        }
        let segments: Vec<&str> = value.split('|').collect();
        let expect = |expected: usize| -> Result<(), ReportKeyError> {
            if segments.len() == expected {
                Ok(())
            } else {
                Err(ReportKeyError::SegmentCount {
                    key: value.to_string(),
                    expected,
                    found: segments.len(),
                })
            }
        };

        match segments[0] {
            "DSS" => {
                expect(4)?;
                let statistic = SourceStatistic::parse(segments[3])
                    .ok_or_else(|| ReportKeyError::UnknownStatistic(segments[3].to_string()))?;
                Ok(ReportKey::dss(segments[1], statistic))
            }
            "CSS" => {
                expect(4)?;
                let statistic = SourceStatistic::parse(segments[3])
                    .ok_or_else(|| ReportKeyError::UnknownStatistic(segments[3].to_string()))?;
                Ok(ReportKey::css(segments[1], segments[2], statistic))
            }
            "ESB" => {
                expect(2)?;
                let bucket = segments[1]
                    .parse()
                    .map_err(|_| ReportKeyError::InvalidBucket(segments[1].to_string()))?;
                Ok(ReportKey::esb(bucket))
            }
            "ERB" => {
                expect(2)?;
                let bucket = segments[1]
                    .parse()
                    .map_err(|_| ReportKeyError::InvalidBucket(segments[1].to_string()))?;
                Ok(ReportKey::erb(bucket))
            }
            other => Err(ReportKeyError::UnknownCode(other.to_string())),
        }
    }
}

impl fmt::Display for ReportKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportKey::DataSourceSummary {
                data_source,
                statistic,
            } => write!(f, "DSS|{data_source}|{data_source}|{statistic}"),
            ReportKey::CrossSourceSummary {
                source,
                versus,
                statistic,
            } => write!(f, "CSS|{source}|{versus}|{statistic}"),
            ReportKey::EntitySizeBreakdown { bucket } => write!(f, "ESB|{bucket}"),
            ReportKey::EntityRelationBreakdown { bucket } => write!(f, "ERB|{bucket}"),
        }
    }
}

/// One signed contribution to an aggregate report row, queued in
/// `sz_dm_pending_report` until an aggregation pass folds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportUpdate {
    pub key: ReportKey,
    pub entity_delta: i64,
    pub record_delta: i64,
    pub relation_delta: i64,
    /// Entity the update originated from, for provenance.
    pub entity_id: EntityId,
    /// The other endpoint when the update concerns a relationship.
    pub related_id: Option<EntityId>,
}

impl ReportUpdate {
    pub fn is_noop(&self) -> bool {
        self.entity_delta == 0 && self.record_delta == 0 && self.relation_delta == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_key_display() {
        assert_eq!(
            ReportKey::dss("CUSTOMERS", SourceStatistic::EntityCount).to_string(),
            "DSS|CUSTOMERS|CUSTOMERS|ENTITY_COUNT"
        );
        assert_eq!(
            ReportKey::css("A", "B", SourceStatistic::PossibleMatchCount).to_string(),
            "CSS|A|B|POSSIBLE_MATCH_COUNT"
        );
        assert_eq!(ReportKey::esb(2).to_string(), "ESB|2");
        assert_eq!(ReportKey::erb(0).to_string(), "ERB|0");
    }

    #[test]
    fn test_report_key_round_trip() {
        let keys = [
            ReportKey::dss("A", SourceStatistic::MatchedCount),
            ReportKey::css("A", "B", SourceStatistic::DisclosedRelationCount),
            ReportKey::esb(17),
            ReportKey::erb(3),
        ];
        for key in keys {
            assert_eq!(ReportKey::parse(&key.to_string()).unwrap(), key);
        }
    }

    #[test]
    fn test_report_key_parse_errors() {
        assert!(matches!(ReportKey::parse(""), Err(ReportKeyError::Empty)));
        assert!(matches!(
            ReportKey::parse("XYZ|1"),
            Err(ReportKeyError::UnknownCode(_))
        ));
        assert!(matches!(
            ReportKey::parse("ESB|two"),
            Err(ReportKeyError::InvalidBucket(_))
        ));
        assert!(matches!(
            ReportKey::parse("DSS|A|A|BOGUS_COUNT"),
            Err(ReportKeyError::UnknownStatistic(_))
        ));
        assert!(matches!(
            ReportKey::parse("DSS|A|A"),
            Err(ReportKeyError::SegmentCount { .. })
        ));
    }

    #[test]
    fn test_statistic_for_match_type() {
        assert_eq!(
            SourceStatistic::for_match_type(MatchType::AmbiguousMatch),
            SourceStatistic::AmbiguousMatchCount
        );
        assert_eq!(
            SourceStatistic::for_match_type(MatchType::PossibleRelation),
            SourceStatistic::PossibleRelationCount
        );
    }

    #[test]
    fn test_noop_update() {
        let update = ReportUpdate {
            key: ReportKey::esb(1),
            entity_delta: 0,
            record_delta: 0,
            relation_delta: 0,
            entity_id: 1,
            related_id: None,
        };
        assert!(update.is_noop());
    }
}
