//! Schedule builder with dependency graph
//!
//! Derives a system execution order from explicit constraints and inferred
//! writer-before-reader dependencies via Kahn's topological sort. Conflicts
//! and cycles are build-time failures, reported before the first tick runs.

use std::collections::VecDeque;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::component::ComponentRegistry;
use crate::error::{EcsError, Result};
use crate::mask;
use crate::system::SystemAccess;

/// One bit per system. Registries wider than 64 systems switch this alias
/// to `u128`.
pub type SystemMask = u64;

pub const MAX_SYSTEMS: usize = SystemMask::BITS as usize;

/// Scheduling view of one enabled system.
pub(crate) struct SystemMeta {
    pub name: &'static str,
    pub access: SystemAccess,
    pub runs_before: Vec<&'static str>,
    pub runs_after: Vec<&'static str>,
}

/// Produce the persisted execution order.
///
/// No-query systems come first in declared order. With-query systems are
/// sorted against explicit `runs_before`/`runs_after` edges plus inferred
/// edges `j → i` wherever `write(j) ∩ read(i) ≠ 0` for an unconstrained
/// pair. Unordered write-write overlap and cycles are errors.
pub(crate) fn build_order(
    metas: &[SystemMeta],
    disabled: &[&'static str],
    registry: &ComponentRegistry,
) -> Result<Vec<usize>> {
    if metas.len() > MAX_SYSTEMS {
        return Err(EcsError::TooManySystems);
    }

    let by_name: FxHashMap<&str, usize> = metas
        .iter()
        .enumerate()
        .map(|(i, m)| (m.name, i))
        .collect();

    // Resolve every referenced name up front so a bad reference fails the
    // build even when the graph would otherwise be trivial.
    for meta in metas {
        for &target in meta.runs_before.iter().chain(meta.runs_after.iter()) {
            if by_name.contains_key(target) {
                continue;
            }
            if disabled.contains(&target) {
                return Err(EcsError::DisabledSystemReference {
                    from: meta.name.to_string(),
                    to: target.to_string(),
                });
            }
            return Err(EcsError::UnknownSystemReference {
                from: meta.name.to_string(),
                to: target.to_string(),
            });
        }
    }

    let (no_query, with_query): (Vec<usize>, Vec<usize>) =
        (0..metas.len()).partition(|&i| metas[i].access.is_empty());

    let count = with_query.len();
    let local_of: FxHashMap<usize, usize> = with_query
        .iter()
        .enumerate()
        .map(|(local, &global)| (global, local))
        .collect();

    // preds[i] holds the set of systems that must run before i.
    // linked[i] marks pairs with an explicit edge in either direction.
    let mut preds = vec![0 as SystemMask; count];
    let mut linked = vec![0 as SystemMask; count];

    let explicit_edge = |from: usize, to: usize, preds: &mut Vec<SystemMask>, linked: &mut Vec<SystemMask>| {
        preds[to] |= 1 << from;
        linked[from] |= 1 << to;
        linked[to] |= 1 << from;
    };

    for (local, &global) in with_query.iter().enumerate() {
        for &target in &metas[global].runs_before {
            if let Some(&lt) = by_name.get(target).and_then(|g| local_of.get(g)) {
                explicit_edge(local, lt, &mut preds, &mut linked);
            }
        }
        for &target in &metas[global].runs_after {
            if let Some(&lt) = by_name.get(target).and_then(|g| local_of.get(g)) {
                explicit_edge(lt, local, &mut preds, &mut linked);
            }
        }
    }

    // Unordered write-write overlap is unresolvable.
    for i in 0..count {
        for j in (i + 1)..count {
            if linked[i] & (1 << j) != 0 {
                continue;
            }
            let a = &metas[with_query[i]].access;
            let b = &metas[with_query[j]].access;
            let overlap = a.writes & b.writes;
            if overlap != 0 {
                let kind = mask::kinds(overlap)
                    .next()
                    .ok_or(EcsError::TooManyComponents)?;
                return Err(EcsError::WriteWriteConflict {
                    first: metas[with_query[i]].name.to_string(),
                    second: metas[with_query[j]].name.to_string(),
                    component: registry.name(kind).to_string(),
                });
            }
        }
    }

    // Inferred edges: a writer precedes every unconstrained reader.
    for i in 0..count {
        for j in 0..count {
            if i == j || linked[i] & (1 << j) != 0 {
                continue;
            }
            let reader = &metas[with_query[i]].access;
            let writer = &metas[with_query[j]].access;
            if writer.writes & reader.reads != 0 {
                preds[i] |= 1 << j;
            }
        }
    }

    // Kahn's algorithm over the predecessor masks.
    let mut remaining = preds.clone();
    let mut placed = vec![false; count];
    let mut queue: VecDeque<usize> = (0..count).filter(|&i| remaining[i] == 0).collect();
    let mut sorted = Vec::with_capacity(count);

    while let Some(node) = queue.pop_front() {
        if placed[node] {
            continue;
        }
        placed[node] = true;
        sorted.push(node);
        for (other, mask_entry) in remaining.iter_mut().enumerate() {
            if *mask_entry & (1 << node) != 0 {
                *mask_entry &= !(1 << node);
                if *mask_entry == 0 && !placed[other] {
                    queue.push_back(other);
                }
            }
        }
    }

    if sorted.len() != count {
        let stuck = (0..count)
            .filter(|&i| !placed[i])
            .map(|i| metas[with_query[i]].name.to_string())
            .collect();
        return Err(EcsError::DependencyCycle(stuck));
    }

    let mut order = no_query;
    order.extend(sorted.into_iter().map(|local| with_query[local]));

    debug!(
        order = ?order.iter().map(|&i| metas[i].name).collect::<Vec<_>>(),
        "system schedule built"
    );
    Ok(order)
}
