use canopy_common::{CellIndex, Rect};

/// Typical node capacity before a split.
pub const DEFAULT_NODE_CAPACITY: usize = 16;

/// Depth cap so stacks of identical or degenerate rects cannot recurse forever.
const MAX_DEPTH: u32 = 16;

/// Spatial index over vegetation cells answering rectangle overlap queries.
///
/// Built once from the full cell list and rebuilt wholesale when cells change.
/// A cell that fits entirely inside one quadrant is pushed down into it; a cell
/// straddling quadrant borders is retained at the parent. Each cell is stored
/// exactly once, so queries never return duplicates.
#[derive(Debug, Clone, Default)]
pub struct CellQuadTree {
    root: Option<QuadNode>,
    capacity: usize,
    len: usize,
}

#[derive(Debug, Clone)]
struct QuadNode {
    bounds: Rect,
    depth: u32,
    cells: Vec<(CellIndex, Rect)>,
    children: Option<Box<[QuadNode; 4]>>,
}

impl CellQuadTree {
    /// Build a tree over `cells`. The root covers `bounds` grown to include
    /// every cell, so no cell is ever outside its node.
    pub fn build(cells: &[(CellIndex, Rect)], bounds: Rect, capacity: usize) -> Self {
        let _span = tracing::debug_span!("quadtree_build", cells = cells.len()).entered();
        let capacity = capacity.max(1);
        if cells.is_empty() {
            return Self {
                root: None,
                capacity,
                len: 0,
            };
        }

        let root_bounds = cells.iter().fold(bounds, |acc, (_, b)| acc.union(b));
        let mut root = QuadNode::new(root_bounds, 0);
        for &item in cells {
            root.insert(item, capacity);
        }

        let tree = Self {
            root: Some(root),
            capacity,
            len: cells.len(),
        };
        tracing::debug!(
            nodes = tree.node_count(),
            depth = tree.depth(),
            "quadtree built"
        );
        tree
    }

    /// Replace the whole tree with one built from `cells`.
    pub fn rebuild(&mut self, cells: &[(CellIndex, Rect)], bounds: Rect) {
        let capacity = if self.capacity == 0 {
            DEFAULT_NODE_CAPACITY
        } else {
            self.capacity
        };
        *self = Self::build(cells, bounds, capacity);
    }

    /// Every cell whose bounds overlap `rect`, in no particular order.
    pub fn query(&self, rect: Rect) -> Vec<CellIndex> {
        let mut out = Vec::new();
        self.query_into(rect, &mut out);
        out
    }

    /// Like [`query`](Self::query) but appends into a caller-owned buffer.
    pub fn query_into(&self, rect: Rect, out: &mut Vec<CellIndex>) {
        if let Some(root) = &self.root {
            root.query(&rect, out);
        }
    }

    /// Number of cells indexed.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Root bounds, if the tree holds any cells.
    pub fn bounds(&self) -> Option<Rect> {
        self.root.as_ref().map(|r| r.bounds)
    }

    pub fn node_count(&self) -> usize {
        self.root.as_ref().map_or(0, QuadNode::node_count)
    }

    /// Deepest level reached (root is 0).
    pub fn depth(&self) -> u32 {
        self.root.as_ref().map_or(0, QuadNode::max_depth)
    }
}

impl QuadNode {
    fn new(bounds: Rect, depth: u32) -> Self {
        Self {
            bounds,
            depth,
            cells: Vec::new(),
            children: None,
        }
    }

    fn insert(&mut self, item: (CellIndex, Rect), capacity: usize) {
        if let Some(children) = self.children.as_mut() {
            match children.iter_mut().find(|c| c.bounds.contains_rect(&item.1)) {
                Some(child) => child.insert(item, capacity),
                None => self.cells.push(item),
            }
            return;
        }

        self.cells.push(item);
        if self.cells.len() > capacity && self.depth < MAX_DEPTH {
            self.split(capacity);
        }
    }

    fn split(&mut self, capacity: usize) {
        let depth = self.depth + 1;
        let quadrants = self.bounds.quadrants();
        self.children = Some(Box::new(quadrants.map(|b| QuadNode::new(b, depth))));
        for item in std::mem::take(&mut self.cells) {
            self.insert(item, capacity);
        }
    }

    fn query(&self, rect: &Rect, out: &mut Vec<CellIndex>) {
        if !self.bounds.overlaps(rect) {
            return;
        }
        out.extend(
            self.cells
                .iter()
                .filter(|(_, b)| b.overlaps(rect))
                .map(|(index, _)| *index),
        );
        if let Some(children) = &self.children {
            for child in children.iter() {
                child.query(rect, out);
            }
        }
    }

    fn node_count(&self) -> usize {
        1 + self
            .children
            .as_ref()
            .map_or(0, |c| c.iter().map(QuadNode::node_count).sum())
    }

    fn max_depth(&self) -> u32 {
        self.children
            .as_ref()
            .and_then(|c| c.iter().map(QuadNode::max_depth).max())
            .unwrap_or(self.depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CellGrid;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn brute_force(cells: &[(CellIndex, Rect)], rect: Rect) -> Vec<CellIndex> {
        let mut hits: Vec<CellIndex> = cells
            .iter()
            .filter(|(_, b)| b.overlaps(&rect))
            .map(|(i, _)| *i)
            .collect();
        hits.sort();
        hits
    }

    fn random_rect(rng: &mut StdRng, extent: f32, max_size: f32) -> Rect {
        let x = rng.gen_range(-extent * 0.1..extent);
        let z = rng.gen_range(-extent * 0.1..extent);
        let w = rng.gen_range(0.5..max_size);
        let d = rng.gen_range(0.5..max_size);
        Rect::from_xz(x, z, w, d)
    }

    #[test]
    fn empty_tree_answers_empty() {
        let tree = CellQuadTree::build(&[], Rect::from_xz(0.0, 0.0, 10.0, 10.0), 4);
        assert!(tree.is_empty());
        assert!(tree.query(Rect::from_xz(0.0, 0.0, 10.0, 10.0)).is_empty());

        let unbuilt = CellQuadTree::default();
        assert!(unbuilt.query(Rect::from_xz(-5.0, -5.0, 10.0, 10.0)).is_empty());
        assert_eq!(unbuilt.node_count(), 0);
    }

    #[test]
    fn grid_cells_split_into_children() {
        let grid = CellGrid::new(Rect::from_xz(0.0, 0.0, 256.0, 256.0), 16.0).unwrap();
        let cells: Vec<_> = grid.cells().collect();
        let tree = CellQuadTree::build(&cells, grid.bounds(), 8);

        assert_eq!(tree.len(), 256);
        assert!(tree.node_count() > 1);
        assert!(tree.depth() >= 2);

        let view = Rect::from_xz(20.0, 20.0, 30.0, 10.0);
        let mut hits = tree.query(view);
        hits.sort();
        assert_eq!(hits, brute_force(&cells, view));
        assert_eq!(hits.len(), 3);
    }

    #[test]
    fn query_matches_brute_force_on_random_input() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for round in 0..20 {
            let count = rng.gen_range(0..300);
            let cells: Vec<(CellIndex, Rect)> = (0..count)
                .map(|i| (CellIndex(i), random_rect(&mut rng, 1000.0, 120.0)))
                .collect();
            let capacity = rng.gen_range(1..32);
            let bounds = Rect::from_xz(0.0, 0.0, 1000.0, 1000.0);
            let tree = CellQuadTree::build(&cells, bounds, capacity);

            for _ in 0..50 {
                let query = random_rect(&mut rng, 1000.0, 400.0);
                let mut hits = tree.query(query);
                hits.sort();
                let before_dedup = hits.len();
                hits.dedup();
                assert_eq!(hits.len(), before_dedup, "duplicate hit in round {round}");
                assert_eq!(hits, brute_force(&cells, query), "mismatch in round {round}");
            }
        }
    }

    #[test]
    fn identical_cells_stop_at_depth_cap() {
        let rect = Rect::from_xz(1.0, 1.0, 0.5, 0.5);
        let cells: Vec<_> = (0..100).map(|i| (CellIndex(i), rect)).collect();
        let tree = CellQuadTree::build(&cells, Rect::from_xz(0.0, 0.0, 4.0, 4.0), 2);
        assert!(tree.depth() <= MAX_DEPTH);
        assert_eq!(tree.query(Rect::from_xz(0.0, 0.0, 4.0, 4.0)).len(), 100);
    }

    #[test]
    fn cells_outside_bounds_are_still_found() {
        let cells = vec![
            (CellIndex(0), Rect::from_xz(0.0, 0.0, 10.0, 10.0)),
            (CellIndex(1), Rect::from_xz(500.0, 500.0, 10.0, 10.0)),
        ];
        let tree = CellQuadTree::build(&cells, Rect::from_xz(0.0, 0.0, 10.0, 10.0), 1);
        assert_eq!(
            tree.query(Rect::from_xz(505.0, 505.0, 1.0, 1.0)),
            vec![CellIndex(1)]
        );
    }

    #[test]
    fn rebuild_replaces_contents() {
        let first = vec![(CellIndex(0), Rect::from_xz(0.0, 0.0, 10.0, 10.0))];
        let mut tree = CellQuadTree::build(&first, Rect::from_xz(0.0, 0.0, 10.0, 10.0), 4);
        let second = vec![
            (CellIndex(7), Rect::from_xz(0.0, 0.0, 5.0, 5.0)),
            (CellIndex(8), Rect::from_xz(5.0, 5.0, 5.0, 5.0)),
        ];
        tree.rebuild(&second, Rect::from_xz(0.0, 0.0, 10.0, 10.0));
        assert_eq!(tree.len(), 2);
        assert_eq!(tree.capacity(), 4);
        let mut hits = tree.query(Rect::from_xz(0.0, 0.0, 10.0, 10.0));
        hits.sort();
        assert_eq!(hits, vec![CellIndex(7), CellIndex(8)]);
    }
}
