//! Timestamp encoding.
//!
//! Timestamps are stored as signed nanoseconds since the Unix epoch so that a
//! record read back from disk compares equal to the record that was written.
//! Replaying an unchanged remote snapshot then produces no writes.

use chrono::{DateTime, Utc};

use crate::error::{Result, StoreError};

pub(crate) fn to_nanos(ts: &DateTime<Utc>) -> Result<i64> {
    ts.timestamp_nanos_opt()
        .ok_or_else(|| StoreError::InvalidRecord(format!("timestamp out of range: {ts}")))
}

pub(crate) fn from_nanos(nanos: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_nanos(nanos)
}
