//! Closed vocabularies for the enrichment envelope and log.
//!
//! Each enum round-trips through its lowercase wire name both in SQLite
//! (via `ToSql`/`FromSql`) and in JSON (via serde).

use std::fmt;
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A stored string did not name a known variant.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Unknown {kind}: '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Enrichment lifecycle of a dataset record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentStatus {
    /// Newly ingested, never enriched.
    Minimal,
    /// Explicitly queued for the next pass.
    Pending,
    /// Claimed by a worker; a stage is in flight.
    Enriching,
    Enriched,
    Failed,
    /// Ineligible for enrichment. Terminal.
    Skipped,
}

impl EnrichmentStatus {
    pub const ALL: [EnrichmentStatus; 6] = [
        EnrichmentStatus::Minimal,
        EnrichmentStatus::Pending,
        EnrichmentStatus::Enriching,
        EnrichmentStatus::Enriched,
        EnrichmentStatus::Failed,
        EnrichmentStatus::Skipped,
    ];

    /// States a worker may claim a record from.
    pub const CLAIMABLE: [EnrichmentStatus; 3] = [
        EnrichmentStatus::Minimal,
        EnrichmentStatus::Pending,
        EnrichmentStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichmentStatus::Minimal => "minimal",
            EnrichmentStatus::Pending => "pending",
            EnrichmentStatus::Enriching => "enriching",
            EnrichmentStatus::Enriched => "enriched",
            EnrichmentStatus::Failed => "failed",
            EnrichmentStatus::Skipped => "skipped",
        }
    }

    pub fn is_claimable(&self) -> bool {
        Self::CLAIMABLE.contains(self)
    }
}

/// One discrete enrichment task applied to a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentStage {
    ApiMetadata,
    Embedding,
    StaticScore,
    LinkValidation,
}

impl EnrichmentStage {
    /// Default pipeline order.
    pub const ALL: [EnrichmentStage; 4] = [
        EnrichmentStage::ApiMetadata,
        EnrichmentStage::Embedding,
        EnrichmentStage::StaticScore,
        EnrichmentStage::LinkValidation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichmentStage::ApiMetadata => "api_metadata",
            EnrichmentStage::Embedding => "embedding",
            EnrichmentStage::StaticScore => "static_score",
            EnrichmentStage::LinkValidation => "link_validation",
        }
    }
}

/// Outcome of one stage attempt as reported by an executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentResult {
    Success,
    Failed,
    RateLimited,
    Skipped,
}

impl EnrichmentResult {
    pub const ALL: [EnrichmentResult; 4] = [
        EnrichmentResult::Success,
        EnrichmentResult::Failed,
        EnrichmentResult::RateLimited,
        EnrichmentResult::Skipped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichmentResult::Success => "success",
            EnrichmentResult::Failed => "failed",
            EnrichmentResult::RateLimited => "rate_limited",
            EnrichmentResult::Skipped => "skipped",
        }
    }

    /// Failed and rate-limited attempts count toward error analytics.
    pub fn is_error(&self) -> bool {
        matches!(self, EnrichmentResult::Failed | EnrichmentResult::RateLimited)
    }
}

macro_rules! wire_enum {
    ($ty:ty, $kind:literal) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::ALL
                    .iter()
                    .copied()
                    .find(|v| v.as_str() == s)
                    .ok_or_else(|| UnknownVariant {
                        kind: $kind,
                        value: s.to_string(),
                    })
            }
        }

        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

wire_enum!(EnrichmentStatus, "enrichment status");
wire_enum!(EnrichmentStage, "enrichment stage");
wire_enum!(EnrichmentResult, "enrichment result");
