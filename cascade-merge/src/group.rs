// SPDX-License-Identifier: MIT
//! Grouping of raw detections into representative rectangles.
//!
//! The scan stage reports every accepted window, so one object shows up as a
//! cluster of heavily-overlapping rectangles. Grouping turns each cluster into
//! a single rectangle and drops isolated detections that do not reach the
//! `min_neighbors` support threshold.

use crate::rects::{intersection_amount, Rect, RectList};

/// Edge of the overlap graph: the other rectangle's index and the overlap
/// amount shared with it.
#[derive(Clone, Copy)]
struct Overlap {
    index: usize,
    amount: f32,
}

/// Per-rectangle adjacency: surviving edges plus the running sum of their
/// weights. A rectangle always intersects itself, hence the 1.0 base weight.
/// `total_amount == 0.0` marks a rectangle that has been removed.
struct OverlapList {
    total_amount: f32,
    edges: Vec<Overlap>,
}

impl OverlapList {
    fn new() -> Self {
        Self {
            total_amount: 1.0,
            edges: Vec::new(),
        }
    }
}

/// Detach rectangle `remove_index` from the graph: every neighbor loses its
/// back-edge and the corresponding weight.
fn remove_item(overlaps: &mut [OverlapList], remove_index: usize) {
    let edges = std::mem::take(&mut overlaps[remove_index].edges);

    for edge in &edges {
        let opposite = &mut overlaps[edge.index];
        if let Some(pos) = opposite.edges.iter().position(|e| e.index == remove_index) {
            opposite.total_amount -= opposite.edges[pos].amount;
            opposite.edges.swap_remove(pos);
        }
    }

    overlaps[remove_index].total_amount = 0.0;
}

/// Round a float rectangle to integer pixel coordinates.
///
/// Corners are rounded half-away-from-zero and the size is taken as the corner
/// difference, so adjacent merged rectangles stay consistent with each other.
fn round_rect(x: f32, y: f32, width: f32, height: f32) -> Rect {
    let x1 = x.round();
    let y1 = y.round();
    let x2 = (x + width).round();
    let y2 = (y + height).round();
    Rect::new(x1, y1, x2 - x1, y2 - y1)
}

/// Cluster raw detections into grouped rectangles.
///
/// With `min_neighbors < 1` grouping is disabled: the input rectangles are
/// returned unchanged, in order. Otherwise every pair with overlap amount of
/// at least 0.5 forms a weighted edge; the best-connected rectangle that has
/// `min_neighbors` group members (itself included) absorbs its remaining
/// neighbors into a weighted average, and rectangles that never reach the
/// threshold are discarded.
pub fn group_rectangles(raw: &RectList, min_neighbors: i32) -> Vec<Rect> {
    let mut grouped = Vec::new();

    if min_neighbors < 1 {
        grouped.extend(raw.iter().copied());
        return grouped;
    }

    let rects = raw.as_slice();
    let mut overlaps: Vec<OverlapList> = (0..rects.len()).map(|_| OverlapList::new()).collect();

    for i1 in 0..rects.len().saturating_sub(1) {
        for i2 in (i1 + 1)..rects.len() {
            let amount = intersection_amount(&rects[i1], &rects[i2]);
            if amount < 0.5 {
                continue;
            }

            overlaps[i1].total_amount += amount;
            overlaps[i1].edges.push(Overlap { index: i2, amount });

            overlaps[i2].total_amount += amount;
            overlaps[i2].edges.push(Overlap { index: i1, amount });
        }
    }

    loop {
        let mut best_amount = 0.0f32;
        let mut best_index = None;

        for (i, list) in overlaps.iter().enumerate() {
            if (list.edges.len() + 1) < min_neighbors as usize {
                continue;
            }
            // Strict comparison keeps the lowest index on ties.
            if list.total_amount > best_amount {
                best_amount = list.total_amount;
                best_index = Some(i);
            }
        }

        let Some(best) = best_index else {
            break;
        };

        let pivot = rects[best];
        let mut sum_x = pivot.x;
        let mut sum_y = pivot.y;
        let mut sum_width = pivot.width;
        let mut sum_height = pivot.height;
        let sum_k = overlaps[best].total_amount;

        // Absorb everything still connected to the pivot. Removing a neighbor
        // also drops its back-edge from the pivot's list, so the loop drains
        // the front until nothing is left.
        loop {
            let Some(&Overlap { index, amount }) = overlaps[best].edges.first() else {
                break;
            };

            let member = rects[index];
            sum_x += member.x * amount;
            sum_y += member.y * amount;
            sum_width += member.width * amount;
            sum_height += member.height * amount;

            remove_item(&mut overlaps, index);
        }

        overlaps[best].total_amount = 0.0;
        overlaps[best].edges.clear();

        grouped.push(round_rect(
            sum_x / sum_k,
            sum_y / sum_k,
            sum_width / sum_k,
            sum_height / sum_k,
        ));
    }

    grouped
}
