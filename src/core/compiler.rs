//! Poll specification compiler.
//!
//! Turns an unordered list of per-object register fragments into a minimal,
//! non-overlapping set of polls per slave, tagged with the strictest
//! refresh requirement that contributed to each.

use std::collections::HashMap;
use std::time::Duration;

use super::register::{RegisterPoll, RegisterRef, RegisterType, SlaveAddress, INVALID_REFRESH};
use super::scheduler::PollSpec;

#[derive(Debug, Clone)]
pub struct PollFragment {
    pub register: RegisterRef,
    pub refresh: Duration,
}

/// Fold `next` into `acc` if they overlap (or, with `consecutive`, are
/// adjacent). On merge the union of the two ranges is kept and the refresh
/// is the minimum of the two — the stricter freshness requirement wins even
/// if the wider fragment asked for a laxer one.
fn try_merge(acc: &mut PollFragment, next: &PollFragment, consecutive: bool) -> bool {
    let mergeable = acc.register.overlaps(&next.register)
        || (consecutive && acc.register.adjacent(&next.register));
    if !mergeable {
        return false;
    }
    let first = acc.register.first_register.min(next.register.first_register);
    let last = acc.register.last_register().max(next.register.last_register());
    acc.register.first_register = first;
    acc.register.count = last - first + 1;
    acc.refresh = acc.refresh.min(next.refresh);
    true
}

fn fold_bucket(mut fragments: Vec<PollFragment>, consecutive: bool) -> Vec<PollFragment> {
    fragments.sort_by_key(|f| f.register.first_register);
    let mut out: Vec<PollFragment> = Vec::new();
    for frag in fragments {
        if let Some(last) = out.last_mut() {
            if try_merge(last, &frag, consecutive) {
                continue;
            }
        }
        out.push(frag);
    }
    out
}

/// Compile per-object register fragments into grouped, refresh-tagged polls.
///
/// `group_consecutive` requests the additional pass that joins
/// adjacent same-kind, same-slave polls into one block read even when they
/// did not originally overlap.
pub fn compile(fragments: Vec<PollFragment>, group_consecutive: bool) -> PollSpec {
    let mut buckets: HashMap<(SlaveAddress, RegisterType), Vec<PollFragment>> = HashMap::new();
    for frag in fragments {
        buckets
            .entry((frag.register.slave, frag.register.kind))
            .or_default()
            .push(frag);
    }

    let mut by_slave: HashMap<SlaveAddress, Vec<RegisterPoll>> = HashMap::new();
    for ((slave, _kind), frags) in buckets {
        let mut merged = fold_bucket(frags, false);
        if group_consecutive {
            merged = fold_bucket(merged, true);
        }
        for frag in merged {
            if frag.refresh == INVALID_REFRESH {
                continue;
            }
            by_slave
                .entry(slave)
                .or_default()
                .push(RegisterPoll::new(frag.register, frag.refresh, super::register::DelayPolicy::NEVER));
        }
    }
    by_slave
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::register::RegisterType;

    fn frag(slave: SlaveAddress, first: u16, count: u16, kind: RegisterType, refresh_ms: u64) -> PollFragment {
        PollFragment {
            register: RegisterRef {
                slave,
                first_register: first,
                count,
                kind,
            },
            refresh: Duration::from_millis(refresh_ms),
        }
    }

    #[test]
    fn merges_overlapping_and_keeps_min_refresh() {
        let frags = vec![
            frag(1, 1, 3, RegisterType::Holding, 5000),
            frag(1, 2, 4, RegisterType::Holding, 1000),
        ];
        let out = compile(frags, false);
        let polls = &out[&1];
        assert_eq!(polls.len(), 1);
        assert_eq!(polls[0].register.first_register, 1);
        assert_eq!(polls[0].register.count, 4);
        assert_eq!(polls[0].refresh, Duration::from_millis(1000));
    }

    #[test]
    fn does_not_merge_gapped_ranges_without_consecutive_mode() {
        let frags = vec![
            frag(1, 1, 2, RegisterType::Holding, 1000),
            frag(1, 4, 2, RegisterType::Holding, 1000),
        ];
        let out = compile(frags, false);
        assert_eq!(out[&1].len(), 2);
    }

    #[test]
    fn groups_consecutive_when_requested() {
        let frags = vec![
            frag(1, 1, 2, RegisterType::Holding, 1000),
            frag(1, 3, 2, RegisterType::Holding, 1000),
        ];
        let out = compile(frags, true);
        assert_eq!(out[&1].len(), 1);
        assert_eq!(out[&1][0].register.count, 4);
    }

    #[test]
    fn drops_invalid_refresh_outputs() {
        let frags = vec![frag(1, 1, 2, RegisterType::Holding, 0)];
        let mut frags = frags;
        frags[0].refresh = INVALID_REFRESH;
        let out = compile(frags, false);
        assert!(out.get(&1).is_none());
    }

    #[test]
    fn separates_by_kind_even_when_ranges_overlap_numerically() {
        let frags = vec![
            frag(1, 1, 3, RegisterType::Holding, 1000),
            frag(1, 1, 3, RegisterType::Coil, 1000),
        ];
        let out = compile(frags, false);
        assert_eq!(out[&1].len(), 2);
    }

    #[test]
    fn idempotent_on_already_compiled_spec() {
        let frags = vec![
            frag(1, 1, 3, RegisterType::Holding, 5000),
            frag(1, 2, 4, RegisterType::Holding, 1000),
        ];
        let once = compile(frags, false);
        let refragged: Vec<PollFragment> = once[&1]
            .iter()
            .map(|p| PollFragment {
                register: p.register,
                refresh: p.refresh,
            })
            .collect();
        let twice = compile(refragged, false);
        assert_eq!(once[&1].len(), twice[&1].len());
        assert_eq!(once[&1][0].register.first_register, twice[&1][0].register.first_register);
        assert_eq!(once[&1][0].register.count, twice[&1][0].register.count);
    }
}
