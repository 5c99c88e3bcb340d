use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use anyhow::Result;

use crate::cap::inspect::{Inspector, ProcEntry};

/// Signed target identifier: positive names a PID, negative a whole process
/// group. Unique within a resolved set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Target(pub i32);

impl Target {
    pub fn raw(self) -> i32 {
        self.0
    }

    pub fn is_group(self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Render a target set the way the dry-run and status output print it.
pub fn format_set(set: &[Target]) -> String {
    set.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Compute the current target set from the user's list plus expansion flags.
/// The set shrinks naturally as processes exit; callers re-resolve every tick.
pub fn resolve(
    user: &[Target],
    group: bool,
    children: bool,
    insp: &dyn Inspector,
) -> Result<Vec<Target>> {
    if !group && !children {
        return Ok(dedup(user.to_vec()));
    }

    // Group-only fast path: one probe per entry, no table scan.
    if !children && insp.has_fast_path() {
        let mut out = Vec::with_capacity(user.len());
        for &t in user {
            if t.is_group() {
                out.push(t);
                continue;
            }
            match insp.pgid_of(t.raw()) {
                Some(g) if g > 1 => out.push(Target(-g)),
                // Ungrouped (pgid 0/1) and vanished processes drop out here;
                // there is no group to widen them to.
                _ => {}
            }
        }
        return Ok(dedup(out));
    }

    let snap = insp.snapshot()?;
    let (pgid_by_pid, children_by_parent) = build_maps(&snap);

    let mut out: Vec<Target> = dedup(user.to_vec());

    if children {
        // Whole-group entries are protected: their members must not reappear
        // as individual PIDs during the walk.
        let protected: HashSet<i32> =
            user.iter().filter(|t| t.is_group()).map(|t| -t.raw()).collect();
        let mut known: HashSet<i32> = out.iter().map(|t| t.raw()).collect();
        let mut queue: VecDeque<i32> = out.iter().map(|t| t.raw().abs()).collect();
        let mut visited: HashSet<i32> = queue.iter().copied().collect();

        while let Some(p) = queue.pop_front() {
            let Some(kids) = children_by_parent.get(&p) else {
                continue;
            };
            for &c in kids {
                if protected.contains(pgid_by_pid.get(&c).unwrap_or(&0)) {
                    continue;
                }
                // Visited-set tracking also breaks cycles a racy snapshot
                // could produce.
                if !visited.insert(c) {
                    continue;
                }
                if known.insert(c) {
                    out.push(Target(c));
                }
                queue.push_back(c);
            }
        }
    }

    if group {
        out = out
            .into_iter()
            .map(|t| {
                if t.is_group() {
                    return t;
                }
                match pgid_by_pid.get(&t.raw()) {
                    Some(&g) if g > 1 => Target(-g),
                    // Ungrouped PIDs stay addressable on their own.
                    _ => t,
                }
            })
            .collect();
    }

    let out = dedup(out);

    // A PID never rides along with its own group: signalling the group
    // already covers it, and double delivery would double the duty cycle.
    let groups: HashSet<i32> = out.iter().filter(|t| t.is_group()).map(|t| -t.raw()).collect();
    let out = out
        .into_iter()
        .filter(|t| {
            if t.is_group() {
                return true;
            }
            match pgid_by_pid.get(&t.raw()) {
                Some(g) => !groups.contains(g),
                None => true,
            }
        })
        .collect();

    Ok(out)
}

fn build_maps(snap: &[ProcEntry]) -> (HashMap<i32, i32>, HashMap<i32, Vec<i32>>) {
    let mut pgid_by_pid = HashMap::with_capacity(snap.len());
    let mut children_by_parent: HashMap<i32, Vec<i32>> = HashMap::new();
    for e in snap {
        pgid_by_pid.insert(e.pid, e.pgid);
        children_by_parent.entry(e.ppid).or_default().push(e.pid);
    }
    // Best-effort: a process reparented to init that is not its own group
    // leader probably double-forked out of a subtree we care about. Adopt it
    // under its group leader so the descendant walk can still find it.
    for e in snap {
        if e.ppid == 1 && e.pid != e.pgid && e.pgid > 1 {
            children_by_parent.entry(e.pgid).or_default().push(e.pid);
        }
    }
    (pgid_by_pid, children_by_parent)
}

fn dedup(v: Vec<Target>) -> Vec<Target> {
    let mut seen = HashSet::with_capacity(v.len());
    v.into_iter().filter(|t| seen.insert(*t)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    /// Table-backed inspector so the walk can be tested against a fixed
    /// process tree.
    struct FakeInspector {
        table: Vec<ProcEntry>,
        fast: bool,
        broken_snapshot: bool,
    }

    impl FakeInspector {
        fn new(table: Vec<(i32, i32, i32)>) -> Self {
            let table = table
                .into_iter()
                .map(|(pid, ppid, pgid)| ProcEntry { pid, ppid, pgid })
                .collect();
            Self { table, fast: true, broken_snapshot: false }
        }
    }

    impl Inspector for FakeInspector {
        fn pgid_of(&self, pid: i32) -> Option<i32> {
            self.table.iter().find(|e| e.pid == pid).map(|e| e.pgid)
        }

        fn snapshot(&self) -> Result<Vec<ProcEntry>> {
            if self.broken_snapshot {
                bail!("scan failed");
            }
            Ok(self.table.clone())
        }

        fn has_fast_path(&self) -> bool {
            self.fast
        }
    }

    fn set(v: &[i32]) -> Vec<Target> {
        v.iter().map(|&p| Target(p)).collect()
    }

    #[test]
    fn no_expansion_returns_input_deduplicated() {
        let insp = FakeInspector::new(vec![]);
        let out = resolve(&set(&[10, -20, 10]), false, false, &insp).unwrap();
        assert_eq!(out, set(&[10, -20]));
    }

    #[test]
    fn group_fast_path_widens_pids() {
        let insp = FakeInspector::new(vec![(10, 2, 100), (11, 2, 100), (12, 2, 200)]);
        let out = resolve(&set(&[10, 11, 12]), true, false, &insp).unwrap();
        assert_eq!(out, set(&[-100, -200]));
    }

    #[test]
    fn group_fast_path_drops_ungrouped_and_missing() {
        let insp = FakeInspector::new(vec![(10, 2, 0), (11, 2, 1)]);
        let out = resolve(&set(&[10, 11, 999]), true, false, &insp).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn group_expansion_without_fast_path_uses_the_table() {
        let mut insp = FakeInspector::new(vec![(10, 2, 100)]);
        insp.fast = false;
        let out = resolve(&set(&[10]), true, false, &insp).unwrap();
        assert_eq!(out, set(&[-100]));
    }

    #[test]
    fn children_walk_collects_descendants() {
        // 10 -> 20 -> 30, plus unrelated 40
        let insp = FakeInspector::new(vec![
            (10, 2, 10),
            (20, 10, 10),
            (30, 20, 10),
            (40, 2, 40),
        ]);
        let mut out = resolve(&set(&[10]), false, true, &insp).unwrap();
        out.sort();
        assert_eq!(out, set(&[10, 20, 30]));
    }

    #[test]
    fn protected_group_is_not_reexpanded() {
        // A=10 with PGID G=100; B=20 is a child of A inside G.
        let insp = FakeInspector::new(vec![(10, 2, 100), (20, 10, 100)]);
        let out = resolve(&set(&[-100, 10]), false, true, &insp).unwrap();
        // B stays covered by the group; A was requested explicitly but is a
        // member of the protected group too.
        assert_eq!(out, set(&[-100]));
    }

    #[test]
    fn group_and_children_collapse_a_family_to_its_group() {
        // Scenario: A=10 (PGID 100), B=20 child of A in the same group.
        let insp = FakeInspector::new(vec![(10, 2, 100), (20, 10, 100)]);
        let mut out = resolve(&set(&[10, 20]), true, true, &insp).unwrap();
        out.sort();
        assert_eq!(out, set(&[-100]));
    }

    #[test]
    fn children_crossing_into_other_groups_stay_individual_without_group_flag() {
        // Child 20 ran setsid/setpgid and lives in its own group.
        let insp = FakeInspector::new(vec![(10, 2, 100), (20, 10, 20)]);
        let mut out = resolve(&set(&[10]), false, true, &insp).unwrap();
        out.sort();
        assert_eq!(out, set(&[10, 20]));
    }

    #[test]
    fn detached_double_forker_is_adopted_through_its_group() {
        // 30 was reparented to init but kept PGID 100, whose leader is 10.
        let insp = FakeInspector::new(vec![(10, 2, 100), (100, 2, 100), (30, 1, 100)]);
        let mut out = resolve(&set(&[100]), false, true, &insp).unwrap();
        out.sort();
        assert_eq!(out, set(&[30, 100]));
    }

    #[test]
    fn no_pid_coexists_with_its_group() {
        // Expansion found group -100 for A, and the user also listed B from
        // the same group.
        let insp = FakeInspector::new(vec![(10, 2, 100), (20, 10, 100)]);
        let out = resolve(&set(&[10, 20]), true, false, &insp).unwrap();
        assert_eq!(out, set(&[-100]));
        for t in &out {
            if !t.is_group() {
                let g = insp.pgid_of(t.raw()).unwrap();
                assert!(!out.contains(&Target(-g)));
            }
        }
    }

    #[test]
    fn snapshot_failure_surfaces_when_children_requested() {
        let mut insp = FakeInspector::new(vec![(10, 2, 100)]);
        insp.broken_snapshot = true;
        assert!(resolve(&set(&[10]), false, true, &insp).is_err());
        // ...but the fast path keeps group-only expansion alive.
        assert!(resolve(&set(&[10]), true, false, &insp).is_ok());
    }

    #[test]
    fn cyclic_snapshot_terminates() {
        // A racy snapshot can show 10 and 20 as each other's parent.
        let insp = FakeInspector::new(vec![(10, 20, 10), (20, 10, 10)]);
        let mut out = resolve(&set(&[10]), false, true, &insp).unwrap();
        out.sort();
        assert_eq!(out, set(&[10, 20]));
    }
}
