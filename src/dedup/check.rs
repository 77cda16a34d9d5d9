//! Dedup consistency check: verify and repair group membership.

use tracing::{info, warn};

use crate::models::RecordFilter;
use crate::repository::{DedupRepository, RecordRepository, Result};

/// Repair log of one consistency walk.
#[derive(Debug, Default, Clone)]
pub struct RepairStats {
    pub groups_checked: u64,
    pub stale_members_removed: u64,
    pub groups_collapsed: u64,
    pub orphans_cleared: u64,
}

/// Walk every group and every grouped record, repairing violations: stale
/// member ids are dropped, collapsed groups marked deleted, and records
/// pointing at groups that do not claim them are detached and re-queued.
pub fn check_dedup_consistency(
    records: &RecordRepository,
    groups: &DedupRepository,
) -> Result<RepairStats> {
    let mut stats = RepairStats::default();

    groups.iterate(|mut group| {
        if group.deleted {
            return Ok(true);
        }
        stats.groups_checked += 1;

        let mut valid = Vec::with_capacity(group.ids.len());
        for member_id in &group.ids {
            let ok = match records.get(member_id)? {
                Some(member) => {
                    !member.deleted && member.dedup_id.as_deref() == Some(group.id.as_str())
                }
                None => false,
            };
            if ok {
                valid.push(member_id.clone());
            } else {
                warn!("Removing stale member {} from group {}", member_id, group.id);
                stats.stale_members_removed += 1;
            }
        }

        if valid.len() != group.ids.len() {
            group.ids = valid;
            group.changed = true;
            group.updated = crate::repository::now();
            if !group.spans_two_sources() {
                warn!("Group {} collapsed below two sources", group.id);
                stats.groups_collapsed += 1;
                group.deleted = true;
                for member_id in &group.ids {
                    records.set_dedup_id(member_id, None)?;
                    records.set_update_needed(member_id, true)?;
                }
                group.ids.clear();
            }
            groups.save(&group)?;
        }
        Ok(true)
    })?;

    // reverse direction: every grouped record must be claimed by its group
    records.iterate(
        &RecordFilter {
            has_dedup_id: Some(true),
            ..Default::default()
        },
        |record| {
            let group_id = record.dedup_id.as_deref().unwrap_or_default();
            let claimed = match groups.get(group_id)? {
                Some(group) => !group.deleted && group.ids.contains(&record.id),
                None => false,
            };
            if !claimed {
                warn!("Clearing orphaned dedup_id {} on {}", group_id, record.id);
                stats.orphans_cleared += 1;
                records.set_dedup_id(&record.id, None)?;
                records.set_update_needed(&record.id, true)?;
            }
            Ok(true)
        },
    )?;

    info!(
        "Dedup check: {} groups, {} stale members removed, {} collapsed, {} orphans cleared",
        stats.groups_checked,
        stats.stale_members_removed,
        stats.groups_collapsed,
        stats.orphans_cleared
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DedupGroup, Record};
    use tempfile::TempDir;

    #[test]
    fn test_repairs_stale_member_and_orphan() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("test.db");
        let records = RecordRepository::new(&db).unwrap();
        let groups = DedupRepository::new(&db).unwrap();

        // group claims a vanished record alongside two good members
        let group = DedupGroup::new(vec!["s1.a".into(), "s2.b".into(), "s3.gone".into()]);
        groups.save(&group).unwrap();
        for id in ["s1.a", "s2.b"] {
            let source = id.split('.').next().unwrap();
            let mut record = Record::new(id.into(), source.into(), "dc".into());
            record.dedup_id = Some(group.id.clone());
            records.save(&record).unwrap();
        }

        // record claiming membership in a group that does not list it
        let mut orphan = Record::new("s1.orphan".into(), "s1".into(), "dc".into());
        orphan.dedup_id = Some("no-such-group".into());
        records.save(&orphan).unwrap();

        let stats = check_dedup_consistency(&records, &groups).unwrap();
        assert_eq!(stats.stale_members_removed, 1);
        assert_eq!(stats.orphans_cleared, 1);
        assert_eq!(stats.groups_collapsed, 0);

        let repaired = groups.get(&group.id).unwrap().unwrap();
        assert_eq!(repaired.ids.len(), 2);

        let orphan = records.get("s1.orphan").unwrap().unwrap();
        assert!(orphan.dedup_id.is_none());
        assert!(orphan.update_needed);
    }

    #[test]
    fn test_collapsed_group_releases_member() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("test.db");
        let records = RecordRepository::new(&db).unwrap();
        let groups = DedupRepository::new(&db).unwrap();

        let group = DedupGroup::new(vec!["s1.a".into(), "s2.gone".into()]);
        groups.save(&group).unwrap();
        let mut record = Record::new("s1.a".into(), "s1".into(), "dc".into());
        record.dedup_id = Some(group.id.clone());
        records.save(&record).unwrap();

        let stats = check_dedup_consistency(&records, &groups).unwrap();
        assert_eq!(stats.groups_collapsed, 1);
        assert!(groups.get(&group.id).unwrap().unwrap().deleted);

        let released = records.get("s1.a").unwrap().unwrap();
        assert!(released.dedup_id.is_none());
        assert!(released.update_needed);
    }
}
