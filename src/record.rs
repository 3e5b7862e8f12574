//! Wire codec for persisted quota records.
//!
//! A record is stored as `"<tokens>|<RFC3339 timestamp>"`. The format is the
//! cross-version contract with every process sharing the store; neither
//! field's rendering can produce the separator, so exactly one `|` must
//! appear. Anything else is corruption, not contention, and is surfaced as a
//! [`RecordError`] rather than retried.

use chrono::{DateTime, SecondsFormat, Utc};

/// Separator between the token count and the refill timestamp.
pub const SEPARATOR: char = '|';

/// Decode failure for a stored quota record.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RecordError {
    /// The value did not contain exactly one separator.
    #[error("malformed quota record: expected exactly one '|' separator, found {found}")]
    FieldCount {
        /// Number of separators present in the stored value.
        found: usize,
    },
    /// The token field did not parse as an unsigned integer.
    #[error("malformed quota record: token count is not an unsigned integer: {0}")]
    Tokens(#[from] std::num::ParseIntError),
    /// The timestamp field did not parse as RFC3339.
    #[error("malformed quota record: refill timestamp is not RFC3339: {0}")]
    Timestamp(#[from] chrono::ParseError),
}

/// The persisted state of one rate-limited identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaRecord {
    /// Tokens still available, `0 ..= capacity`.
    pub tokens: u32,
    /// Reference point for refill arithmetic. Never moves backward for a
    /// given identity.
    pub refilled_at: DateTime<Utc>,
}

impl QuotaRecord {
    /// Render the record in its wire format.
    pub fn encode(&self) -> String {
        format!(
            "{}{}{}",
            self.tokens,
            SEPARATOR,
            self.refilled_at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
        )
    }

    /// Parse a stored value back into a record.
    pub fn decode(raw: &str) -> Result<Self, RecordError> {
        let fields: Vec<&str> = raw.split(SEPARATOR).collect();
        if fields.len() != 2 {
            return Err(RecordError::FieldCount { found: fields.len().saturating_sub(1) });
        }
        let tokens = fields[0].parse::<u32>()?;
        let refilled_at = DateTime::parse_from_rfc3339(fields[1])?.with_timezone(&Utc);
        Ok(Self { tokens, refilled_at })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn encode_matches_wire_format() {
        let record = QuotaRecord { tokens: 3, refilled_at: at(1_700_000_000) };
        assert_eq!(record.encode(), "3|2023-11-14T22:13:20Z");
    }

    #[test]
    fn round_trips_whole_seconds() {
        let record = QuotaRecord { tokens: 7, refilled_at: at(1_700_000_000) };
        assert_eq!(QuotaRecord::decode(&record.encode()).unwrap(), record);
    }

    #[test]
    fn round_trips_subsecond_precision() {
        let refilled_at = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        let record = QuotaRecord { tokens: 0, refilled_at };
        assert_eq!(QuotaRecord::decode(&record.encode()).unwrap(), record);
    }

    #[test]
    fn decode_accepts_offset_timestamps() {
        let record = QuotaRecord::decode("5|2023-11-14T23:13:20+01:00").unwrap();
        assert_eq!(record.tokens, 5);
        assert_eq!(record.refilled_at, at(1_700_000_000));
    }

    #[test]
    fn rejects_missing_separator() {
        assert_eq!(QuotaRecord::decode("5"), Err(RecordError::FieldCount { found: 0 }));
        assert_eq!(QuotaRecord::decode(""), Err(RecordError::FieldCount { found: 0 }));
    }

    #[test]
    fn rejects_extra_separators() {
        assert_eq!(
            QuotaRecord::decode("5|2023-11-14T22:13:20Z|trailing"),
            Err(RecordError::FieldCount { found: 2 })
        );
    }

    #[test]
    fn rejects_non_integer_tokens() {
        assert!(matches!(
            QuotaRecord::decode("five|2023-11-14T22:13:20Z"),
            Err(RecordError::Tokens(_))
        ));
    }

    #[test]
    fn rejects_negative_tokens() {
        assert!(matches!(
            QuotaRecord::decode("-1|2023-11-14T22:13:20Z"),
            Err(RecordError::Tokens(_))
        ));
    }

    #[test]
    fn rejects_bad_timestamp() {
        assert!(matches!(QuotaRecord::decode("5|yesterday"), Err(RecordError::Timestamp(_))));
    }
}
