//! Domain types shared by the scheduler, the phase state machine and storage.
//!
//! Every status is a closed enum. Values are persisted as lowercase text and
//! decoding an unknown value from the database is an error, never a fallback.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A stored value did not match any variant of a closed enum.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid {kind} value '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    pub(crate) fn new(kind: &'static str, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}

/// Implements `Display`, `ToSql` and `FromSql` for a text-backed enum that
/// already provides `as_str()` and `FromStr<Err = ParseEnumError>`.
///
/// Child modules see it through textual scope, so it must stay above the
/// `mod` declarations.
macro_rules! text_enum_sql {
    ($ty:ty) => {
        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl rusqlite::types::ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
                Ok(rusqlite::types::ToSqlOutput::from(self.as_str()))
            }
        }

        impl rusqlite::types::FromSql for $ty {
            fn column_result(
                value: rusqlite::types::ValueRef<'_>,
            ) -> rusqlite::types::FromSqlResult<Self> {
                let text = value.as_str()?;
                text.parse::<$ty>()
                    .map_err(|e| rusqlite::types::FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

pub mod audit;
pub mod job;
pub mod phase;
pub mod product;

pub use audit::{LogAction, LogLevel, PipelineLog};
pub use job::{BackgroundJob, JobLease, JobPriority, JobStatus};
pub use phase::{PhaseOutput, PhaseStatus, PipelinePhase};
pub use product::{Product, ProductStatus, ProductStatusChange};

/// The four ordered enrichment phases a product passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Recognition,
    MarketResearch,
    Pricing,
    Seo,
}

impl Phase {
    pub const ALL: [Phase; 4] = [
        Phase::Recognition,
        Phase::MarketResearch,
        Phase::Pricing,
        Phase::Seo,
    ];

    pub const FIRST: Phase = Phase::Recognition;
    pub const LAST: Phase = Phase::Seo;

    /// Phase number as stored in `phase_number` columns (1..=4).
    pub fn number(self) -> u8 {
        match self {
            Phase::Recognition => 1,
            Phase::MarketResearch => 2,
            Phase::Pricing => 3,
            Phase::Seo => 4,
        }
    }

    pub fn from_number(number: u8) -> Result<Self, ParseEnumError> {
        match number {
            1 => Ok(Phase::Recognition),
            2 => Ok(Phase::MarketResearch),
            3 => Ok(Phase::Pricing),
            4 => Ok(Phase::Seo),
            other => Err(ParseEnumError::new("phase", other.to_string())),
        }
    }

    pub fn next(self) -> Option<Self> {
        Self::from_number(self.number() + 1).ok()
    }

    pub fn previous(self) -> Option<Self> {
        self.number()
            .checked_sub(1)
            .and_then(|n| Self::from_number(n).ok())
    }

    pub fn is_last(self) -> bool {
        self == Self::LAST
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Recognition => "recognition",
            Phase::MarketResearch => "market research",
            Phase::Pricing => "pricing",
            Phase::Seo => "seo",
        };
        write!(f, "phase {} ({})", self.number(), name)
    }
}

impl FromStr for Phase {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let number: u8 = s
            .trim()
            .parse()
            .map_err(|_| ParseEnumError::new("phase", s))?;
        Self::from_number(number)
    }
}

impl rusqlite::types::ToSql for Phase {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        Ok(rusqlite::types::ToSqlOutput::from(i64::from(self.number())))
    }
}

impl rusqlite::types::FromSql for Phase {
    fn column_result(value: rusqlite::types::ValueRef<'_>) -> rusqlite::types::FromSqlResult<Self> {
        let raw = value.as_i64()?;
        let number = u8::try_from(raw).map_err(|_| rusqlite::types::FromSqlError::OutOfRange(raw))?;
        Phase::from_number(number).map_err(|e| rusqlite::types::FromSqlError::Other(Box::new(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_numbers_round_trip() {
        for phase in Phase::ALL {
            assert_eq!(Phase::from_number(phase.number()).unwrap(), phase);
        }
        assert!(Phase::from_number(0).is_err());
        assert!(Phase::from_number(5).is_err());
    }

    #[test]
    fn test_phase_ordering_links() {
        assert_eq!(Phase::Recognition.next(), Some(Phase::MarketResearch));
        assert_eq!(Phase::Seo.next(), None);
        assert_eq!(Phase::Recognition.previous(), None);
        assert_eq!(Phase::Pricing.previous(), Some(Phase::MarketResearch));
        assert!(Phase::Seo.is_last());
        assert!(Phase::Recognition < Phase::Seo);
    }

    #[test]
    fn test_phase_parse_from_str() {
        assert_eq!("3".parse::<Phase>().unwrap(), Phase::Pricing);
        let err = "seven".parse::<Phase>().unwrap_err();
        assert_eq!(err.kind, "phase");
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(Phase::MarketResearch.to_string(), "phase 2 (market research)");
    }
}
