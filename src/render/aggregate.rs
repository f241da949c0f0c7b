//! Line aggregation: joins line segments sharing a metadata group into
//! longer polylines wherever a shared endpoint has exactly two incident
//! segments with compatible direction, leaving endpoints of any other
//! degree as forced cuts ("burned").
//!
//! Built as a merge-tree: a binary tree of `line` nodes, each leaf owning
//! one input segment and each interior node recording which of its two
//! children to walk first and whether to reverse it. Here the tree lives
//! in a flat arena indexed by `usize`
//! instead of owned pointers, the same pattern this crate's quad-tree
//! build step already uses.

use crate::fixed::{FixedLine, FixedXy};

struct Node {
    from: Option<FixedXy>,
    to: Option<FixedXy>,
    left: Option<usize>,
    right: Option<usize>,
    segment: Option<usize>,
    reversed: bool,
}

/// Looks up the segment incident to `pos` other than `self_slot`. Returns
/// `None` either when nothing is incident, or when the endpoint's degree
/// isn't exactly two — in the latter case every live segment touching
/// `pos` has that endpoint "burned" (set to `None`) so it can never be
/// joined across again.
fn find_incident(
    idx: &[(FixedXy, usize)],
    slots: &[Option<usize>],
    nodes: &mut [Node],
    self_slot: usize,
    pos: Option<FixedXy>,
) -> Option<usize> {
    let pos = pos?;
    let start = idx.partition_point(|(p, _)| (p.x, p.y) < (pos.x, pos.y));
    let end = start + idx[start..].iter().take_while(|(p, _)| *p == pos).count();

    let mut count = 0;
    let mut other = None;
    for &(_, slot) in &idx[start..end] {
        count += 1;
        if slot == self_slot {
            continue;
        }
        if slots[slot].is_some() {
            other = Some(slot);
        }
    }
    if count == 2 {
        return other;
    }

    for &(_, slot) in &idx[start..end] {
        if let Some(node_idx) = slots[slot] {
            if nodes[node_idx].from == Some(pos) {
                nodes[node_idx].from = None;
            }
            if nodes[node_idx].to == Some(pos) {
                nodes[node_idx].to = None;
            }
        }
    }
    None
}

/// True when `a` and `b` are each still a single, unmerged input segment
/// and span the same unordered pair of endpoints — two segments
/// duplicating each other end to end rather than chaining through a
/// shared point. Joining these would fold a pair of coincident segments
/// into one degenerate there-and-back path, so they're left distinct.
/// Doesn't apply once either side is already a merged chain: closing a
/// longer cycle legitimately ends with the accumulated chain's endpoints
/// matching the final segment's.
fn same_endpoint_pair(a: &Node, b: &Node) -> bool {
    if a.segment.is_none() || b.segment.is_none() {
        return false;
    }
    (a.from == b.from && a.to == b.to) || (a.from == b.to && a.to == b.from)
}

fn mark_reversed(nodes: &mut [Node], root: usize) {
    let mut stack = vec![root];
    while let Some(cur) = stack.pop() {
        nodes[cur].reversed = !nodes[cur].reversed;
        if let Some(l) = nodes[cur].left {
            stack.push(l);
        }
        if let Some(r) = nodes[cur].right {
            stack.push(r);
        }
    }
}

fn walk_geometry(nodes: &[Node], segments: &[FixedLine], root: usize) -> FixedLine {
    if let Some(seg_idx) = nodes[root].segment {
        return segments[seg_idx].clone();
    }
    let mut joined: FixedLine = Vec::new();
    let mut stack = vec![root];
    while let Some(cur) = stack.pop() {
        let node = &nodes[cur];
        if let Some(seg_idx) = node.segment {
            let seg = &segments[seg_idx];
            let skip = if joined.is_empty() { 0 } else { 1 };
            if node.reversed {
                let take = seg.len().saturating_sub(skip);
                joined.extend(seg[..take].iter().rev().copied());
            } else {
                joined.extend(seg[skip.min(seg.len())..].iter().copied());
            }
        } else {
            // in-order (left, right) normally; reversed flips the visit order
            // so the output still reads left-to-right once flattened.
            if node.reversed {
                stack.push(node.left.unwrap());
                stack.push(node.right.unwrap());
            } else {
                stack.push(node.right.unwrap());
                stack.push(node.left.unwrap());
            }
        }
    }
    joined
}

/// Joins `segments` (each a distinct polyline already known to share one
/// metadata group) wherever endpoints match with degree exactly two,
/// honoring `oneway` — shared across the whole call since every segment in
/// a metadata group carries the same tags. A oneway segment is never
/// reversed, and is never joined at an endpoint that would require
/// reversing it.
pub fn aggregate_lines(segments: Vec<FixedLine>, oneway: bool) -> Vec<FixedLine> {
    let n = segments.len();
    let mut nodes: Vec<Node> = (0..n)
        .map(|i| Node {
            from: segments[i].first().copied(),
            to: segments[i].last().copied(),
            left: None,
            right: None,
            segment: Some(i),
            reversed: false,
        })
        .collect();
    let mut slots: Vec<Option<usize>> = (0..n).map(Some).collect();

    let mut idx: Vec<(FixedXy, usize)> = Vec::with_capacity(n * 2);
    for (slot, node) in nodes.iter().enumerate() {
        if let Some(p) = node.from {
            idx.push((p, slot));
        }
        if let Some(p) = node.to {
            idx.push((p, slot));
        }
    }
    idx.sort_by(|a, b| (a.0.x, a.0.y, a.1).cmp(&(b.0.x, b.0.y, b.1)));

    for self_slot in 0..n {
        let mut cur = match slots[self_slot] {
            Some(c) => c,
            None => continue,
        };
        if nodes[cur].from == nodes[cur].to {
            continue;
        }

        loop {
            let from = nodes[cur].from;
            let other_slot = match find_incident(&idx, &slots, &mut nodes, self_slot, from) {
                Some(s) => s,
                None => break,
            };
            let other = match slots[other_slot] {
                Some(o) => o,
                None => break,
            };
            if nodes[other].from == nodes[other].to {
                break; // other is a cycle; can't extend into it
            }
            if same_endpoint_pair(&nodes[cur], &nodes[other]) {
                break; // duplicate segment sharing both endpoints; not a real join
            }

            let joined_to = nodes[cur].to;
            let (joined_from, reverse_other) = if nodes[cur].from == nodes[other].to {
                (nodes[other].from, false)
            } else {
                if oneway {
                    break;
                }
                (nodes[other].to, true)
            };
            if reverse_other {
                mark_reversed(&mut nodes, other);
            }

            nodes.push(Node {
                from: joined_from,
                to: joined_to,
                left: Some(other),
                right: Some(cur),
                segment: None,
                reversed: false,
            });
            let new_idx = nodes.len() - 1;
            slots[other_slot] = None;
            slots[self_slot] = Some(new_idx);
            cur = new_idx;
        }

        if nodes[cur].from == nodes[cur].to {
            continue; // cycle detected — never joined further
        }

        loop {
            let to = nodes[cur].to;
            let other_slot = match find_incident(&idx, &slots, &mut nodes, self_slot, to) {
                Some(s) => s,
                None => break,
            };
            let other = match slots[other_slot] {
                Some(o) => o,
                None => break,
            };
            if nodes[other].from == nodes[other].to {
                break;
            }
            if same_endpoint_pair(&nodes[cur], &nodes[other]) {
                break;
            }

            let joined_from = nodes[cur].from;
            let (joined_to, reverse_other) = if nodes[cur].to == nodes[other].from {
                (nodes[other].to, false)
            } else {
                if oneway {
                    break;
                }
                (nodes[other].from, true)
            };
            if reverse_other {
                mark_reversed(&mut nodes, other);
            }

            nodes.push(Node {
                from: joined_from,
                to: joined_to,
                left: Some(cur),
                right: Some(other),
                segment: None,
                reversed: false,
            });
            let new_idx = nodes.len() - 1;
            slots[other_slot] = None;
            slots[self_slot] = Some(new_idx);
            cur = new_idx;
        }
    }

    slots
        .into_iter()
        .flatten()
        .map(|root| walk_geometry(&nodes, &segments, root))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xy(x: i64, y: i64) -> FixedXy {
        FixedXy::new(x, y)
    }

    #[test]
    fn chain_joins_in_order() {
        let a_b = vec![xy(10, 10), xy(11, 11)];
        let b_c = vec![xy(11, 11), xy(12, 12)];
        let out = aggregate_lines(vec![a_b, b_c], false);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0], vec![xy(10, 10), xy(11, 11), xy(12, 12)]);
    }

    #[test]
    fn shared_to_endpoint_reverses_second_segment() {
        let a_b = vec![xy(0, 0), xy(1, 1)];
        let c_b = vec![xy(2, 2), xy(1, 1)];
        let out = aggregate_lines(vec![a_b, c_b], false);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0], vec![xy(0, 0), xy(1, 1), xy(2, 2)]);
    }

    #[test]
    fn identical_endpoints_stay_distinct_segments() {
        let l1 = vec![xy(0, 0), xy(1, 1)];
        let l2 = vec![xy(0, 0), xy(1, 1)];
        let out = aggregate_lines(vec![l1, l2], false);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn degree_three_endpoint_is_never_joined() {
        let a = vec![xy(0, 0), xy(5, 5)];
        let b = vec![xy(5, 5), xy(10, 0)];
        let c = vec![xy(5, 5), xy(10, 10)];
        let out = aggregate_lines(vec![a, b, c], false);
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn oneway_segment_is_never_reversed() {
        let a_b = vec![xy(0, 0), xy(1, 1)];
        let b_c = vec![xy(2, 2), xy(1, 1)];
        let out = aggregate_lines(vec![a_b, b_c], true);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn cycle_is_left_intact() {
        let a = vec![xy(0, 0), xy(1, 0)];
        let b = vec![xy(1, 0), xy(1, 1)];
        let c = vec![xy(1, 1), xy(0, 0)];
        let out = aggregate_lines(vec![a, b, c], false);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].first(), out[0].last());
    }
}
