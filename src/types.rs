//! Core data model: partitions, continuation tokens, change records and leases.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Identifier of a source partition.
///
/// Uses `Arc<str>` so that the id can be cloned into every worker, lease entry
/// and log span without allocating.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct PartitionId(Arc<str>);

impl PartitionId {
    pub fn new(id: impl AsRef<str>) -> Self {
        PartitionId(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PartitionId {
    fn from(value: &str) -> Self {
        PartitionId(Arc::from(value))
    }
}

impl From<String> for PartitionId {
    fn from(value: String) -> Self {
        PartitionId(Arc::from(value))
    }
}

impl From<PartitionId> for String {
    fn from(id: PartitionId) -> Self {
        id.0.to_string()
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque cursor into a partition's change stream.
///
/// Internally this is the log sequence number of the last consumed record;
/// [`ContinuationToken::BEGINNING`] means nothing has been consumed yet.
/// Outside the crate it should only be stored and handed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContinuationToken(u64);

impl ContinuationToken {
    /// Token positioned before the first record of a partition.
    pub const BEGINNING: Self = ContinuationToken(0);

    /// Token resuming after the record with the given sequence number.
    #[inline]
    pub const fn after(lsn: u64) -> Self {
        ContinuationToken(lsn)
    }

    /// Sequence number of the last consumed record (0 if none).
    #[inline]
    pub const fn last_lsn(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_beginning(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ContinuationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", self.0)
    }
}

impl FromStr for ContinuationToken {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_matches('"');
        trimmed
            .parse::<u64>()
            .map(ContinuationToken)
            .map_err(|_| Error::InvalidToken(s.to_string()))
    }
}

impl TryFrom<String> for ContinuationToken {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ContinuationToken> for String {
    fn from(token: ContinuationToken) -> Self {
        token.0.to_string()
    }
}

/// One change captured from the source store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Per-partition log sequence number, strictly increasing from 1.
    pub lsn: u64,
    /// Partition key value of the changed item.
    pub id: String,
    /// The item as written.
    pub body: serde_json::Value,
    /// When the change was recorded by the store.
    pub timestamp: DateTime<Utc>,
}

/// An ordered slice of one partition's change stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeBatch {
    pub partition: PartitionId,
    /// Records in ascending `lsn` order.
    pub records: Vec<ChangeRecord>,
    /// Token to resume after this batch.
    pub continuation: ContinuationToken,
}

impl ChangeBatch {
    /// An empty batch that leaves the token where it was.
    pub fn empty(partition: PartitionId, continuation: ContinuationToken) -> Self {
        Self {
            partition,
            records: Vec::new(),
            continuation,
        }
    }

    /// Build a batch from records read after `from`.
    ///
    /// The continuation is the last record's sequence number, or `from` when
    /// there are no records.
    pub fn from_records(
        partition: PartitionId,
        records: Vec<ChangeRecord>,
        from: ContinuationToken,
    ) -> Self {
        let continuation = records
            .last()
            .map(|r| ContinuationToken::after(r.lsn))
            .unwrap_or(from);
        Self {
            partition,
            records,
            continuation,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn first_lsn(&self) -> Option<u64> {
        self.records.first().map(|r| r.lsn)
    }

    pub fn last_lsn(&self) -> Option<u64> {
        self.records.last().map(|r| r.lsn)
    }
}

/// Ownership record for one partition.
///
/// At most one host may hold a non-expired lease for a partition. Every
/// successful write bumps `version` by one; writes are conditional on the
/// version the writer last read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Prefix that scopes leases of one logical processor.
    pub lease_prefix: String,
    pub partition_id: PartitionId,
    /// Host currently owning the partition, if any.
    pub owner: Option<String>,
    /// Last checkpointed position.
    pub continuation: ContinuationToken,
    /// When ownership lapses unless renewed.
    pub expires_at: Option<DateTime<Utc>>,
    /// Store-assigned version for optimistic concurrency.
    pub version: u64,
    /// When this version was written.
    pub timestamp: DateTime<Utc>,
}

impl Lease {
    /// A fresh, unowned lease. The store assigns the first version on create.
    pub fn new(lease_prefix: &str, partition_id: PartitionId, continuation: ContinuationToken) -> Self {
        Self {
            lease_prefix: lease_prefix.to_string(),
            partition_id,
            owner: None,
            continuation,
            expires_at: None,
            version: 0,
            timestamp: Utc::now(),
        }
    }

    /// Key of this lease in the lease store.
    pub fn key(&self) -> String {
        lease_key(&self.lease_prefix, &self.partition_id)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expiry) => expiry <= now,
            None => true,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Owner whose claim is still live.
    pub fn live_owner_at(&self, now: DateTime<Utc>) -> Option<&str> {
        match &self.owner {
            Some(owner) if !self.is_expired_at(now) => Some(owner.as_str()),
            _ => None,
        }
    }

    /// Returns true if `host` holds this lease and it has not expired.
    pub fn is_owned_by(&self, host: &str) -> bool {
        self.live_owner_at(Utc::now()) == Some(host)
    }

    /// Returns true if any host may acquire this lease now.
    pub fn is_available_at(&self, now: DateTime<Utc>) -> bool {
        self.live_owner_at(now).is_none()
    }
}

/// Build the store key for a partition lease.
pub fn lease_key(lease_prefix: &str, partition: &PartitionId) -> String {
    format!("{}..{}", lease_prefix, partition)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn record(lsn: u64) -> ChangeRecord {
        ChangeRecord {
            lsn,
            id: format!("item-{}", lsn),
            body: serde_json::json!({ "id": format!("item-{}", lsn) }),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_token_parse_and_display() {
        let token: ContinuationToken = "\"42\"".parse().unwrap();
        assert_eq!(token.last_lsn(), 42);
        assert_eq!(token.to_string(), "\"42\"");
        assert_eq!("7".parse::<ContinuationToken>().unwrap(), ContinuationToken::after(7));
    }

    #[test]
    fn test_token_rejects_garbage() {
        let err = "abc".parse::<ContinuationToken>().unwrap_err();
        assert!(matches!(err, Error::InvalidToken(_)));
    }

    #[test]
    fn test_token_ordering() {
        assert!(ContinuationToken::BEGINNING < ContinuationToken::after(1));
        assert!(ContinuationToken::BEGINNING.is_beginning());
        assert!(!ContinuationToken::after(1).is_beginning());
    }

    #[test]
    fn test_batch_from_records_advances_token() {
        let batch = ChangeBatch::from_records(
            PartitionId::from("0"),
            vec![record(5), record(6), record(7)],
            ContinuationToken::after(4),
        );
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.first_lsn(), Some(5));
        assert_eq!(batch.last_lsn(), Some(7));
        assert_eq!(batch.continuation, ContinuationToken::after(7));
    }

    #[test]
    fn test_empty_batch_keeps_token() {
        let batch =
            ChangeBatch::from_records(PartitionId::from("0"), vec![], ContinuationToken::after(9));
        assert!(batch.is_empty());
        assert_eq!(batch.continuation, ContinuationToken::after(9));
    }

    #[test]
    fn test_lease_serde_keeps_token_opaque() {
        let mut lease = Lease::new("reproducer", PartitionId::from("2"), ContinuationToken::after(64));
        lease.owner = Some("local".to_string());
        let json = serde_json::to_value(&lease).unwrap();
        assert_eq!(json["continuation"], serde_json::json!("64"));
        assert_eq!(json["partition_id"], serde_json::json!("2"));

        let decoded: Lease = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, lease);
    }

    #[test]
    fn test_lease_expiry_and_ownership() {
        let now = Utc::now();
        let mut lease = Lease::new("p", PartitionId::from("0"), ContinuationToken::BEGINNING);
        assert!(lease.is_available_at(now));

        lease.owner = Some("host-a".to_string());
        lease.expires_at = Some(now + ChronoDuration::seconds(30));
        assert_eq!(lease.live_owner_at(now), Some("host-a"));
        assert!(!lease.is_available_at(now));
        assert!(lease.is_owned_by("host-a"));
        assert!(!lease.is_owned_by("host-b"));

        let later = now + ChronoDuration::seconds(31);
        assert!(lease.is_expired_at(later));
        assert!(lease.is_available_at(later));
    }

    #[test]
    fn test_lease_key() {
        assert_eq!(lease_key("reproducer", &PartitionId::from("4")), "reproducer..4");
    }
}
