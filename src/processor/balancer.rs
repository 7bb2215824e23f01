//! Fair-share lease selection.
//!
//! Each host aims for `ceil(partitions / hosts)` leases, where the hosts are
//! the distinct owners of live leases plus the host itself. A host only takes
//! leases that are unowned, expired, or still recorded as its own; it never
//! steals a live lease from another host.

use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};

use crate::types::{Lease, PartitionId};

/// Number of leases `host` should hold.
pub fn fair_share(leases: &[Lease], host: &str, now: DateTime<Utc>) -> usize {
    if leases.is_empty() {
        return 0;
    }
    let mut hosts: BTreeSet<&str> = leases.iter().filter_map(|l| l.live_owner_at(now)).collect();
    hosts.insert(host);
    leases.len().div_ceil(hosts.len())
}

/// Pick the leases `host` should try to acquire this round.
///
/// `owned` is the set of partitions the host already holds, `excluded` the
/// partitions it must not take (quarantined). Leases still recorded as owned
/// by `host` come first, the rest in random order so competing hosts spread
/// out instead of racing for the same partitions.
pub fn select_leases_to_acquire(
    leases: &[Lease],
    host: &str,
    owned: &HashSet<PartitionId>,
    excluded: &HashSet<PartitionId>,
    now: DateTime<Utc>,
) -> Vec<Lease> {
    let share = fair_share(leases, host, now);
    let wanted = share.saturating_sub(owned.len());
    if wanted == 0 {
        return Vec::new();
    }

    let (mut ours, mut free): (Vec<Lease>, Vec<Lease>) = leases
        .iter()
        .filter(|l| !owned.contains(&l.partition_id) && !excluded.contains(&l.partition_id))
        .filter(|l| match l.live_owner_at(now) {
            None => true,
            Some(owner) => owner == host,
        })
        .cloned()
        .partition(|l| l.owner.as_deref() == Some(host));

    fastrand::shuffle(&mut free);
    ours.append(&mut free);
    ours.truncate(wanted);
    ours
}
