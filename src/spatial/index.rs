// N-dimensional R-tree over a flat node pool.
//
// Nodes are addressed by index into the pool; a branch binds a bounding
// box to either a child node (internal) or a record handle (leaf). Leaves
// are exactly the nodes at height 0 and all leaves share a depth. Nodes
// detached during removal stay in the pool as garbage; the graph is
// rebuilt from disk on open.
//
// Concurrency: one reader/writer lock. Insert/remove take the write lock,
// searches the read lock. Search callbacks run under the read lock and
// must not call back into mutating operations on the same index.

use crate::common::{BlockAddress, PageId, RecordId};
use crate::error::{Result, StoreError};
use crate::spatial::bbox::{BoundingBox, BoxManager};
use crate::storage::fixed_page::{FixedPage, FixedPageManager};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct IndexOptions {
    pub dimension: usize,
    pub max_children: usize,
    pub min_children: usize,
    pub page_bytes: usize,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            dimension: 2,
            max_children: 8,
            min_children: 4,
            page_bytes: 4096,
        }
    }
}

impl IndexOptions {
    fn validate(&self) -> Result<()> {
        if self.dimension == 0 {
            return Err(StoreError::InvalidArgument("dimension must be > 0".into()));
        }
        if self.max_children < 2 {
            return Err(StoreError::InvalidArgument(
                "max_children must be >= 2".into(),
            ));
        }
        if self.min_children == 0 || self.min_children > self.max_children / 2 {
            return Err(StoreError::InvalidArgument(format!(
                "min_children must be in 1..={}",
                self.max_children / 2
            )));
        }
        Ok(())
    }
}

/// One emitted search result.
pub struct SearchHit<'a> {
    pub bbox: &'a BoundingBox,
    pub record: RecordId,
}

/// Search callback seam; return `false` to stop the traversal.
pub trait QueryCallback {
    fn process(&mut self, hit: SearchHit<'_>) -> bool;
}

impl<F: FnMut(SearchHit<'_>) -> bool> QueryCallback for F {
    fn process(&mut self, hit: SearchHit<'_>) -> bool {
        self(hit)
    }
}

type NodeId = usize;

struct Branch {
    bbox: BoundingBox,
    child: Option<NodeId>,
    record: Option<RecordId>,
}

struct Node {
    height: i32,
    page: PageId,
    offset: i32,
    branches: Vec<Branch>,
}

struct Core {
    nodes: Vec<Node>,
    root: NodeId,
    len: usize,
}

impl Core {
    fn alloc_node(&mut self, height: i32, capacity: usize) -> NodeId {
        self.nodes.push(Node {
            height,
            page: 0,
            offset: -1,
            branches: Vec::with_capacity(capacity),
        });
        self.nodes.len() - 1
    }
}

pub struct SpatialIndex {
    opts: IndexOptions,
    bm: BoxManager,
    core: RwLock<Core>,
}

impl SpatialIndex {
    pub fn new(opts: IndexOptions) -> Result<Self> {
        opts.validate()?;
        let bm = BoxManager::new(opts.dimension)?;
        let mut core = Core {
            nodes: Vec::new(),
            root: 0,
            len: 0,
        };
        core.root = core.alloc_node(0, opts.max_children);
        Ok(Self {
            opts,
            bm,
            core: RwLock::new(core),
        })
    }

    pub fn options(&self) -> &IndexOptions {
        &self.opts
    }

    pub fn box_manager(&self) -> &BoxManager {
        &self.bm
    }

    /// Number of leaf entries.
    pub fn len(&self) -> usize {
        self.core.read().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn height(&self) -> i32 {
        let core = self.core.read();
        core.nodes[core.root].height
    }

    fn check_dim(&self, bbox: &BoundingBox) -> Result<()> {
        if bbox.dimension() != self.opts.dimension {
            return Err(StoreError::InvalidArgument(format!(
                "{}-dimensional box in a {}-dimensional index",
                bbox.dimension(),
                self.opts.dimension
            )));
        }
        Ok(())
    }

    pub fn insert(&self, bbox: &BoundingBox, record: RecordId) -> Result<()> {
        self.check_dim(bbox)?;
        let mut core = self.core.write();
        let branch = Branch {
            bbox: bbox.clone(),
            child: None,
            record: Some(record),
        };
        self.insert_branch(&mut core, branch, 0);
        core.len += 1;
        Ok(())
    }

    /// Removes the entry holding `record`, matching by record identity and
    /// descending only into branches overlapping `bbox`. Succeeds silently
    /// when the record is absent; returns whether an entry was removed.
    pub fn remove(&self, bbox: &BoundingBox, record: RecordId) -> Result<bool> {
        self.check_dim(bbox)?;
        let mut core = self.core.write();
        let root = core.root;
        let mut orphans = Vec::new();
        let found = self.recursive_remove(&mut core, root, bbox, record, &mut orphans);
        if !found {
            return Ok(false);
        }
        core.len -= 1;

        // Reinsert each orphaned node's branches at that node's height;
        // the subtrees stay balanced because they re-enter at their level.
        for orphan in orphans {
            let height = core.nodes[orphan].height;
            let branches: Vec<Branch> = core.nodes[orphan].branches.drain(..).collect();
            for branch in branches {
                self.insert_branch(&mut core, branch, height);
            }
        }

        while core.nodes[core.root].height > 0 && core.nodes[core.root].branches.len() == 1 {
            core.root = core.nodes[core.root].branches[0]
                .child
                .expect("internal branch has a child");
        }
        Ok(true)
    }

    pub fn search_overlap<C: QueryCallback>(&self, query: &BoundingBox, cb: &mut C) -> Result<()> {
        self.check_dim(query)?;
        let core = self.core.read();
        self.walk_overlap(&core, core.root, query, cb);
        Ok(())
    }

    /// Emits entries whose box covers the query.
    pub fn search_contains_range<C: QueryCallback>(
        &self,
        query: &BoundingBox,
        cb: &mut C,
    ) -> Result<()> {
        self.check_dim(query)?;
        let core = self.core.read();
        self.walk_contains(&core, core.root, query, cb);
        Ok(())
    }

    /// Emits entries whose box lies inside the query.
    pub fn search_cover<C: QueryCallback>(&self, query: &BoundingBox, cb: &mut C) -> Result<()> {
        self.check_dim(query)?;
        let core = self.core.read();
        self.walk_cover(&core, core.root, query, cb);
        Ok(())
    }

    fn walk_overlap<C: QueryCallback>(
        &self,
        core: &Core,
        node: NodeId,
        query: &BoundingBox,
        cb: &mut C,
    ) -> bool {
        let leaf = core.nodes[node].height == 0;
        for branch in &core.nodes[node].branches {
            if !self.bm.is_overlap(&branch.bbox, query) {
                continue;
            }
            if leaf {
                if let Some(record) = branch.record {
                    if !cb.process(SearchHit {
                        bbox: &branch.bbox,
                        record,
                    }) {
                        return false;
                    }
                }
            } else {
                let child = branch.child.expect("internal branch has a child");
                if !self.walk_overlap(core, child, query, cb) {
                    return false;
                }
            }
        }
        true
    }

    fn walk_contains<C: QueryCallback>(
        &self,
        core: &Core,
        node: NodeId,
        query: &BoundingBox,
        cb: &mut C,
    ) -> bool {
        let leaf = core.nodes[node].height == 0;
        for branch in &core.nodes[node].branches {
            if !self.bm.contains_range(&branch.bbox, query) {
                continue;
            }
            if leaf {
                if let Some(record) = branch.record {
                    if !cb.process(SearchHit {
                        bbox: &branch.bbox,
                        record,
                    }) {
                        return false;
                    }
                }
            } else {
                let child = branch.child.expect("internal branch has a child");
                if !self.walk_contains(core, child, query, cb) {
                    return false;
                }
            }
        }
        true
    }

    fn walk_cover<C: QueryCallback>(
        &self,
        core: &Core,
        node: NodeId,
        query: &BoundingBox,
        cb: &mut C,
    ) -> bool {
        let leaf = core.nodes[node].height == 0;
        for branch in &core.nodes[node].branches {
            if leaf {
                if self.bm.contains_range(query, &branch.bbox) {
                    if let Some(record) = branch.record {
                        if !cb.process(SearchHit {
                            bbox: &branch.bbox,
                            record,
                        }) {
                            return false;
                        }
                    }
                }
            } else if self.bm.is_overlap(&branch.bbox, query) {
                let child = branch.child.expect("internal branch has a child");
                if !self.walk_cover(core, child, query, cb) {
                    return false;
                }
            }
        }
        true
    }

    fn insert_branch(&self, core: &mut Core, branch: Branch, height: i32) {
        let root = core.root;
        if let Some(sibling) = self.recursive_insert(core, root, branch, height) {
            // Root split: the tree grows upward by one level.
            let old_root = core.root;
            let new_root = core.alloc_node(core.nodes[old_root].height + 1, self.opts.max_children);
            let first = Branch {
                bbox: self.node_cover(core, old_root),
                child: Some(old_root),
                record: None,
            };
            core.nodes[new_root].branches.push(first);
            let second = Branch {
                bbox: self.node_cover(core, sibling),
                child: Some(sibling),
                record: None,
            };
            core.nodes[new_root].branches.push(second);
            core.root = new_root;
        }
    }

    /// Descends to the target height and adds the branch, splitting on
    /// overflow. Returns the split sibling when this node split.
    fn recursive_insert(
        &self,
        core: &mut Core,
        node: NodeId,
        branch: Branch,
        height: i32,
    ) -> Option<NodeId> {
        if core.nodes[node].height == height {
            return self.add_branch(core, node, branch);
        }

        let idx = self.select_best_branch(core, node, &branch.bbox);
        let child = core.nodes[node].branches[idx]
            .child
            .expect("internal branch has a child");
        let branch_box = branch.bbox.clone();

        match self.recursive_insert(core, child, branch, height) {
            Some(sibling) => {
                core.nodes[node].branches[idx].bbox = self.node_cover(core, child);
                let extra = Branch {
                    bbox: self.node_cover(core, sibling),
                    child: Some(sibling),
                    record: None,
                };
                self.add_branch(core, node, extra)
            }
            None => {
                let merged = self
                    .bm
                    .union(&core.nodes[node].branches[idx].bbox, &branch_box);
                core.nodes[node].branches[idx].bbox = merged;
                None
            }
        }
    }

    fn recursive_remove(
        &self,
        core: &mut Core,
        node: NodeId,
        bbox: &BoundingBox,
        record: RecordId,
        orphans: &mut Vec<NodeId>,
    ) -> bool {
        if core.nodes[node].height == 0 {
            if let Some(idx) = core.nodes[node]
                .branches
                .iter()
                .position(|b| b.record == Some(record))
            {
                core.nodes[node].branches.swap_remove(idx);
                return true;
            }
            return false;
        }

        for idx in 0..core.nodes[node].branches.len() {
            if !self.bm.is_overlap(&core.nodes[node].branches[idx].bbox, bbox) {
                continue;
            }
            let child = core.nodes[node].branches[idx]
                .child
                .expect("internal branch has a child");
            if self.recursive_remove(core, child, bbox, record, orphans) {
                if core.nodes[child].branches.len() >= self.opts.min_children {
                    core.nodes[node].branches[idx].bbox = self.node_cover(core, child);
                } else {
                    orphans.push(child);
                    core.nodes[node].branches.swap_remove(idx);
                }
                return true;
            }
        }
        false
    }

    fn add_branch(&self, core: &mut Core, node: NodeId, branch: Branch) -> Option<NodeId> {
        if core.nodes[node].branches.len() < self.opts.max_children {
            core.nodes[node].branches.push(branch);
            None
        } else {
            Some(self.split_node(core, node, branch))
        }
    }

    /// Quadratic split: seeds maximize wasted area, remaining entries go
    /// to the group that would grow less, with a forced fill once a group
    /// nears `total - min_children`.
    fn split_node(&self, core: &mut Core, node: NodeId, extra: Branch) -> NodeId {
        let height = core.nodes[node].height;
        let mut buffer: Vec<Branch> = core.nodes[node].branches.drain(..).collect();
        buffer.push(extra);
        let total = buffer.len();
        debug_assert_eq!(total, self.opts.max_children + 1);

        let areas: Vec<f64> = buffer.iter().map(|b| self.bm.area(&b.bbox)).collect();
        let mut seeds = (0, 1);
        let mut worst = f64::NEG_INFINITY;
        for i in 0..total - 1 {
            for j in i + 1..total {
                let waste =
                    self.bm.area(&self.bm.union(&buffer[i].bbox, &buffer[j].bbox)) - areas[i] - areas[j];
                if waste > worst {
                    worst = waste;
                    seeds = (i, j);
                }
            }
        }

        const UNASSIGNED: usize = usize::MAX;
        let mut assign = vec![UNASSIGNED; total];
        let mut group_box: [Option<BoundingBox>; 2] = [None, None];
        let mut counts = [0usize; 2];
        let mut place = |assign: &mut Vec<usize>,
                         group_box: &mut [Option<BoundingBox>; 2],
                         counts: &mut [usize; 2],
                         idx: usize,
                         group: usize| {
            assign[idx] = group;
            group_box[group] = Some(match &group_box[group] {
                Some(b) => self.bm.union(b, &buffer[idx].bbox),
                None => buffer[idx].bbox.clone(),
            });
            counts[group] += 1;
        };
        place(&mut assign, &mut group_box, &mut counts, seeds.0, 0);
        place(&mut assign, &mut group_box, &mut counts, seeds.1, 1);

        let limit = total - self.opts.min_children;
        while counts[0] + counts[1] < total && counts[0] < limit && counts[1] < limit {
            let mut chosen = UNASSIGNED;
            let mut better = 0;
            let mut biggest_diff = f64::NEG_INFINITY;
            for idx in 0..total {
                if assign[idx] != UNASSIGNED {
                    continue;
                }
                let growth = |g: usize| -> f64 {
                    match &group_box[g] {
                        Some(b) => {
                            self.bm.area(&self.bm.union(b, &buffer[idx].bbox)) - self.bm.area(b)
                        }
                        None => areas[idx],
                    }
                };
                let (g0, g1) = (growth(0), growth(1));
                let (group, diff) = if g1 >= g0 { (0, g1 - g0) } else { (1, g0 - g1) };
                if chosen == UNASSIGNED || diff > biggest_diff {
                    chosen = idx;
                    better = group;
                    biggest_diff = diff;
                } else if diff == biggest_diff && counts[group] < counts[better] {
                    chosen = idx;
                    better = group;
                }
            }
            place(&mut assign, &mut group_box, &mut counts, chosen, better);
        }

        if counts[0] + counts[1] < total {
            let group = if counts[0] >= limit { 1 } else { 0 };
            for idx in 0..total {
                if assign[idx] == UNASSIGNED {
                    place(&mut assign, &mut group_box, &mut counts, idx, group);
                }
            }
        }
        debug_assert!(counts[0] >= self.opts.min_children);
        debug_assert!(counts[1] >= self.opts.min_children);

        let sibling = core.alloc_node(height, self.opts.max_children);
        for (idx, branch) in buffer.into_iter().enumerate() {
            let target = if assign[idx] == 0 { node } else { sibling };
            core.nodes[target].branches.push(branch);
        }
        sibling
    }

    fn select_best_branch(&self, core: &Core, node: NodeId, bbox: &BoundingBox) -> usize {
        let mut best = 0;
        let mut best_incr = f64::INFINITY;
        let mut best_area = f64::INFINITY;
        for (idx, branch) in core.nodes[node].branches.iter().enumerate() {
            let area = self.bm.area(&branch.bbox);
            let incr = self.bm.area(&self.bm.union(&branch.bbox, bbox)) - area;
            if incr < best_incr || (incr == best_incr && area < best_area) {
                best = idx;
                best_incr = incr;
                best_area = area;
            }
        }
        best
    }

    fn node_cover(&self, core: &Core, node: NodeId) -> BoundingBox {
        let branches = &core.nodes[node].branches;
        match branches.split_first() {
            Some((first, rest)) => {
                let mut cover = first.bbox.clone();
                for branch in rest {
                    cover = self.bm.union(&cover, &branch.bbox);
                }
                cover
            }
            None => self.bm.create(),
        }
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Serialized slot size: height, child_count, page, offset, then
    /// max_children branches of (box edges, child page, child offset).
    fn node_size(&self) -> usize {
        4 + 4 + 8 + 4 + self.opts.max_children * (self.opts.dimension * 16 + 12)
    }

    /// Serializes the tree breadth-first into fixed-slot pages: the root
    /// lands in slot 0 of page 1, children follow their parent's page.
    /// Leaf entries store their record's heap address in the child
    /// fields, so `resolve` must return signed addresses (flush first).
    pub fn save<P, F>(&self, path: P, resolve: F) -> Result<()>
    where
        P: AsRef<Path>,
        F: Fn(RecordId) -> BlockAddress,
    {
        let mut core = self.core.write();
        let node_size = self.node_size();
        let mut fpm = FixedPageManager::new(self.opts.page_bytes, node_size)?;

        let root = core.root;
        let (page, offset) = fpm.assign(1)?;
        core.nodes[root].page = page;
        core.nodes[root].offset = offset;

        let mut queue = VecDeque::new();
        queue.push_back(root);
        while let Some(nid) = queue.pop_front() {
            for idx in 0..core.nodes[nid].branches.len() {
                if let Some(child) = core.nodes[nid].branches[idx].child {
                    let (page, offset) = fpm.assign(core.nodes[nid].page)?;
                    core.nodes[child].page = page;
                    core.nodes[child].offset = offset;
                    queue.push_back(child);
                }
            }
            let buf = self.encode_node(&core, nid, &resolve);
            let page_id = core.nodes[nid].page;
            let slot = core.nodes[nid].offset as usize / node_size;
            let page = fpm
                .page_mut(page_id)
                .ok_or_else(|| StoreError::Corruption("assigned page missing".into()))?;
            page.write_slot(slot, &buf)?;
        }

        let mut file = File::create(path)?;
        file.write_all(&(fpm.page_count() as u64).to_le_bytes())?;
        file.write_all(&core.nodes[root].page.to_le_bytes())?;
        file.write_all(&core.nodes[root].offset.to_le_bytes())?;
        for p in 1..=fpm.page_count() as u64 {
            let image = fpm
                .page(p)
                .ok_or_else(|| StoreError::Corruption("page vanished during save".into()))?
                .serialize(self.opts.page_bytes)?;
            file.write_all(&image)?;
        }
        file.sync_all()?;
        debug!(
            pages = fpm.page_count(),
            entries = core.len,
            "saved spatial index"
        );
        Ok(())
    }

    fn encode_node<F>(&self, core: &Core, nid: NodeId, resolve: &F) -> Vec<u8>
    where
        F: Fn(RecordId) -> BlockAddress,
    {
        let node = &core.nodes[nid];
        let mut buf = Vec::with_capacity(self.node_size());
        buf.extend_from_slice(&node.height.to_le_bytes());
        buf.extend_from_slice(&(node.branches.len() as i32).to_le_bytes());
        buf.extend_from_slice(&node.page.to_le_bytes());
        buf.extend_from_slice(&node.offset.to_le_bytes());
        for branch in &node.branches {
            for &(lo, hi) in branch.bbox.axes() {
                buf.extend_from_slice(&lo.to_le_bytes());
                buf.extend_from_slice(&hi.to_le_bytes());
            }
            let (child_page, child_offset) = match branch.child {
                Some(child) => (core.nodes[child].page, core.nodes[child].offset),
                None => {
                    let addr = resolve(branch.record.expect("leaf branch has a record"));
                    (addr.page_id, addr.offset)
                }
            };
            buf.extend_from_slice(&child_page.to_le_bytes());
            buf.extend_from_slice(&child_offset.to_le_bytes());
        }
        buf.resize(self.node_size(), 0);
        buf
    }

    /// Loads a saved tree, registering each leaf entry's heap address
    /// through `register` to obtain its record handle.
    pub fn load<P, F>(path: P, opts: IndexOptions, mut register: F) -> Result<Self>
    where
        P: AsRef<Path>,
        F: FnMut(BlockAddress) -> Result<RecordId>,
    {
        opts.validate()?;
        let bm = BoxManager::new(opts.dimension)?;
        let bytes = std::fs::read(path)?;
        if bytes.len() < 20 {
            return Err(StoreError::Corruption("index file header truncated".into()));
        }
        let page_count = u64::from_le_bytes(bytes[0..8].try_into().expect("8-byte slice"));
        let root_page = u64::from_le_bytes(bytes[8..16].try_into().expect("8-byte slice"));
        let root_offset = i32::from_le_bytes(bytes[16..20].try_into().expect("4-byte slice"));

        let node_size = 4 + 4 + 8 + 4 + opts.max_children * (opts.dimension * 16 + 12);
        let expected = (page_count as usize)
            .checked_mul(opts.page_bytes)
            .and_then(|n| n.checked_add(20))
            .ok_or_else(|| StoreError::Corruption("absurd index page count".into()))?;
        if bytes.len() != expected {
            return Err(StoreError::Corruption(format!(
                "index file is {} bytes, expected {expected}",
                bytes.len()
            )));
        }

        let mut raw: HashMap<(PageId, i32), RawNode> = HashMap::new();
        for p in 0..page_count as usize {
            let start = 20 + p * opts.page_bytes;
            let page =
                FixedPage::deserialize(opts.page_bytes, node_size, &bytes[start..start + opts.page_bytes])?;
            for slot in 0..page.slot_count() {
                if page.is_slot_used(slot)? {
                    let node = RawNode::decode(&opts, page.read_slot(slot)?)?;
                    raw.insert((page.page_id(), (slot * node_size) as i32), node);
                }
            }
        }

        let mut core = Core {
            nodes: Vec::new(),
            root: 0,
            len: 0,
        };
        let mut visited = HashSet::new();
        let root = Self::build_node(
            &bm,
            &mut core,
            &raw,
            (root_page, root_offset),
            &mut register,
            &mut visited,
        )?;
        core.root = root;
        debug!(entries = core.len, "loaded spatial index");
        Ok(Self {
            opts,
            bm,
            core: RwLock::new(core),
        })
    }

    fn build_node<F>(
        bm: &BoxManager,
        core: &mut Core,
        raw: &HashMap<(PageId, i32), RawNode>,
        key: (PageId, i32),
        register: &mut F,
        visited: &mut HashSet<(PageId, i32)>,
    ) -> Result<NodeId>
    where
        F: FnMut(BlockAddress) -> Result<RecordId>,
    {
        if !visited.insert(key) {
            return Err(StoreError::Corruption(
                "index node graph contains a cycle".into(),
            ));
        }
        let raw_node = raw.get(&key).ok_or_else(|| {
            StoreError::Corruption(format!("dangling node pointer ({}, {})", key.0, key.1))
        })?;
        let nid = core.alloc_node(raw_node.height, raw_node.branches.len());
        core.nodes[nid].page = key.0;
        core.nodes[nid].offset = key.1;

        for rb in &raw_node.branches {
            let bbox = bm.from_edges(&rb.edges).map_err(|_| {
                StoreError::Corruption("inverted interval in a stored bounding box".into())
            })?;
            let branch = if raw_node.height == 0 {
                let addr = BlockAddress::new(rb.child_page, rb.child_offset);
                if !addr.is_signed() {
                    return Err(StoreError::Corruption(
                        "leaf entry stored without a signed record address".into(),
                    ));
                }
                core.len += 1;
                Branch {
                    bbox,
                    child: None,
                    record: Some(register(addr)?),
                }
            } else {
                let child = Self::build_node(
                    bm,
                    core,
                    raw,
                    (rb.child_page, rb.child_offset),
                    register,
                    visited,
                )?;
                if core.nodes[child].height != raw_node.height - 1 {
                    return Err(StoreError::Corruption(
                        "child node height disagrees with its parent".into(),
                    ));
                }
                Branch {
                    bbox,
                    child: Some(child),
                    record: None,
                }
            };
            core.nodes[nid].branches.push(branch);
        }
        Ok(nid)
    }

    /// Asserts the structural invariants: non-leaf branch boxes equal the
    /// union of their child's boxes, all leaves share a depth, non-root
    /// fanout stays within bounds, and `len` counts the leaf entries.
    #[doc(hidden)]
    pub fn check_invariants(&self) {
        let core = self.core.read();
        let mut leaves = 0usize;
        self.check_node(&core, core.root, true, &mut leaves);
        assert_eq!(leaves, core.len);
    }

    fn check_node(&self, core: &Core, node: NodeId, is_root: bool, leaves: &mut usize) {
        let n = &core.nodes[node];
        if !is_root {
            assert!(
                n.branches.len() >= self.opts.min_children
                    && n.branches.len() <= self.opts.max_children,
                "fanout {} outside [{}, {}]",
                n.branches.len(),
                self.opts.min_children,
                self.opts.max_children
            );
        }
        if n.height == 0 {
            *leaves += n.branches.len();
            for branch in &n.branches {
                assert!(branch.record.is_some());
            }
            return;
        }
        for branch in &n.branches {
            let child = branch.child.expect("internal branch has a child");
            assert_eq!(core.nodes[child].height, n.height - 1, "uneven leaf depth");
            let cover = self.node_cover(core, child);
            assert!(
                self.bm.equal(&branch.bbox, &cover),
                "branch box must equal the union of its child's boxes"
            );
            self.check_node(core, child, false, leaves);
        }
    }
}

struct RawBranch {
    edges: Vec<(f64, f64)>,
    child_page: PageId,
    child_offset: i32,
}

struct RawNode {
    height: i32,
    branches: Vec<RawBranch>,
}

impl RawNode {
    fn decode(opts: &IndexOptions, slot: &[u8]) -> Result<Self> {
        let read_i32 =
            |at: usize| i32::from_le_bytes([slot[at], slot[at + 1], slot[at + 2], slot[at + 3]]);
        let read_u64 = |at: usize| {
            u64::from_le_bytes(slot[at..at + 8].try_into().expect("8-byte slice"))
        };
        let read_f64 = |at: usize| {
            f64::from_le_bytes(slot[at..at + 8].try_into().expect("8-byte slice"))
        };

        let height = read_i32(0);
        let count = read_i32(4);
        if height < 0 {
            return Err(StoreError::Corruption(format!(
                "negative node height {height}"
            )));
        }
        if count < 0 || count as usize > opts.max_children {
            return Err(StoreError::Corruption(format!(
                "node child count {count} exceeds {}",
                opts.max_children
            )));
        }
        let mut branches = Vec::with_capacity(count as usize);
        let mut at = 20;
        for _ in 0..count {
            let mut edges = Vec::with_capacity(opts.dimension);
            for _ in 0..opts.dimension {
                let lo = read_f64(at);
                let hi = read_f64(at + 8);
                edges.push((lo, hi));
                at += 16;
            }
            let child_page = read_u64(at);
            let child_offset = read_i32(at + 8);
            at += 12;
            branches.push(RawBranch {
                edges,
                child_page,
                child_offset,
            });
        }
        Ok(Self { height, branches })
    }
}
