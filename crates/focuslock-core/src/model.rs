//! Restriction and focus-session records.
//!
//! A [`RestrictionRecord`] is either permanent (no end time) or timed (ends at
//! a stored instant). The two are never mixed: the fields are private and the
//! only constructors are [`RestrictionRecord::permanent`] and
//! [`RestrictionRecord::timed`], so `is_permanent() == end_time().is_none()`
//! holds for every value, including ones decoded from storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::remaining_ms;
use crate::error::ValidationError;

/// Opaque handle to an application icon, owned by the app catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IconRef(String);

impl IconRef {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// What the app catalog knows about an installed package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppMetadata {
    pub display_name: String,
    pub icon_ref: IconRef,
}

/// A rule blocking one application, permanently or until `end_time`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "StoredRestriction", into = "StoredRestriction")]
pub struct RestrictionRecord {
    package_id: String,
    display_name: String,
    icon_ref: IconRef,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
}

impl RestrictionRecord {
    pub fn permanent(
        package_id: impl Into<String>,
        metadata: AppMetadata,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            package_id: package_id.into(),
            display_name: metadata.display_name,
            icon_ref: metadata.icon_ref,
            start_time,
            end_time: None,
        }
    }

    /// # Errors
    /// Returns [`ValidationError::InvalidTimeRange`] unless `end_time > start_time`.
    pub fn timed(
        package_id: impl Into<String>,
        metadata: AppMetadata,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        if end_time <= start_time {
            return Err(ValidationError::InvalidTimeRange {
                start: start_time,
                end: end_time,
            });
        }
        Ok(Self {
            package_id: package_id.into(),
            display_name: metadata.display_name,
            icon_ref: metadata.icon_ref,
            start_time,
            end_time: Some(end_time),
        })
    }

    pub fn package_id(&self) -> &str {
        &self.package_id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn icon_ref(&self) -> &IconRef {
        &self.icon_ref
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    pub fn is_permanent(&self) -> bool {
        self.end_time.is_none()
    }

    /// Strict comparison shared by lazy expiry and the tick loop:
    /// a timed record is expired once `now > end_time`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.end_time, Some(end) if now > end)
    }

    /// Same record with the icon handle re-resolved by the catalog. Only used
    /// while rebuilding records at load time.
    pub(crate) fn with_icon(mut self, icon_ref: IconRef) -> Self {
        self.icon_ref = icon_ref;
        self
    }

    /// Time left before expiry, or `None` for permanent records.
    pub fn remaining_ms(&self, now: DateTime<Utc>) -> Option<u64> {
        self.end_time.map(|end| remaining_ms(now, end))
    }
}

/// How long a new restriction lasts, as requested by an observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RestrictionTerm {
    Permanent,
    For { duration_ms: u64 },
    Until { end_time: DateTime<Utc> },
}

impl RestrictionTerm {
    pub fn minutes(minutes: u64) -> Self {
        RestrictionTerm::For {
            duration_ms: minutes.saturating_mul(60_000),
        }
    }

    /// Build the record this term describes, starting at `start_time`.
    pub fn into_record(
        self,
        package_id: impl Into<String>,
        metadata: AppMetadata,
        start_time: DateTime<Utc>,
    ) -> Result<RestrictionRecord, ValidationError> {
        let end_time = match self {
            RestrictionTerm::Permanent => {
                return Ok(RestrictionRecord::permanent(package_id, metadata, start_time));
            }
            RestrictionTerm::For { duration_ms } => i64::try_from(duration_ms)
                .ok()
                .and_then(|ms| start_time.checked_add_signed(chrono::Duration::milliseconds(ms)))
                .ok_or_else(|| ValidationError::InvalidValue {
                    field: "duration_ms".into(),
                    message: format!("{duration_ms}ms is out of range"),
                })?,
            RestrictionTerm::Until { end_time } => end_time,
        };
        RestrictionRecord::timed(package_id, metadata, start_time, end_time)
    }
}

/// On-disk shape of a restriction. Carries `is_permanent` explicitly so that
/// a blob with contradictory fields is rejected instead of silently repaired.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRestriction {
    package_id: String,
    display_name: String,
    #[serde(default)]
    icon_ref: IconRef,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    is_permanent: bool,
}

impl TryFrom<StoredRestriction> for RestrictionRecord {
    type Error = ValidationError;

    fn try_from(raw: StoredRestriction) -> Result<Self, Self::Error> {
        let metadata = AppMetadata {
            display_name: raw.display_name,
            icon_ref: raw.icon_ref,
        };
        match (raw.is_permanent, raw.end_time) {
            (true, None) => Ok(Self::permanent(raw.package_id, metadata, raw.start_time)),
            (false, Some(end)) => Self::timed(raw.package_id, metadata, raw.start_time, end),
            (is_permanent, _) => Err(ValidationError::PermanenceMismatch {
                package_id: raw.package_id,
                is_permanent,
            }),
        }
    }
}

impl From<RestrictionRecord> for StoredRestriction {
    fn from(record: RestrictionRecord) -> Self {
        let is_permanent = record.is_permanent();
        Self {
            package_id: record.package_id,
            display_name: record.display_name,
            icon_ref: record.icon_ref,
            start_time: record.start_time,
            end_time: record.end_time,
            is_permanent,
        }
    }
}

/// The single global focus countdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FocusSession {
    end_time: Option<DateTime<Utc>>,
}

impl FocusSession {
    pub fn idle() -> Self {
        Self { end_time: None }
    }

    pub fn ending_at(end_time: DateTime<Utc>) -> Self {
        Self {
            end_time: Some(end_time),
        }
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    pub fn is_active(&self) -> bool {
        self.end_time.is_some()
    }

    /// Focus ends inclusively: `now >= end_time`.
    pub fn is_finished_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.end_time, Some(end) if now >= end)
    }

    pub fn remaining_ms(&self, now: DateTime<Utc>) -> Option<u64> {
        self.end_time.map(|end| remaining_ms(now, end))
    }
}
