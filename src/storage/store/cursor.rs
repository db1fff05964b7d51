use std::sync::Arc;

use crate::types::{
    EdgeId, GroupId, LabelId, NodeId, PropId, PropRecId, PropValue, Result, SombraError, TypeId,
};

use super::file::{PageCursor, RecordFile};
use super::records::{EdgeRecord, GroupRecord, NodeRecord, PropRecord, Record};
use super::refs::{EdgeRef, EdgeSelection};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Mode {
    Idle,
    Scan,
    Single,
}

/// Raw iteration over one record file, by full scan, id range, or single id.
///
/// A scan keeps the high mark it observed and refreshes it only when it runs past
/// it, so records committed while the scan is in flight are still visited.
pub struct RecordCursor<R: Record> {
    file: Option<Arc<RecordFile<R>>>,
    page: PageCursor<R>,
    record: R,
    current: Option<u64>,
    next_id: u64,
    end: u64,
    high_mark: u64,
    mode: Mode,
}

/// Store-level node cursor.
pub type StoreNodeCursor = RecordCursor<NodeRecord>;
/// Store-level edge cursor.
pub type StoreEdgeCursor = RecordCursor<EdgeRecord>;

impl<R: Record> Default for RecordCursor<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Record> RecordCursor<R> {
    /// Creates an idle cursor.
    pub fn new() -> Self {
        Self {
            file: None,
            page: PageCursor::default(),
            record: R::default(),
            current: None,
            next_id: 0,
            end: 0,
            high_mark: 0,
            mode: Mode::Idle,
        }
    }

    /// Starts a full scan from id 0.
    pub fn scan(&mut self, file: &Arc<RecordFile<R>>) {
        self.scan_range(file, 0, u64::MAX);
    }

    /// Starts a scan over `[start, end)`; `end == u64::MAX` is unbounded.
    pub fn scan_range(&mut self, file: &Arc<RecordFile<R>>, start: u64, end: u64) {
        self.attach(file);
        self.next_id = start;
        self.end = end;
        self.high_mark = file.high_id();
        self.mode = Mode::Scan;
    }

    /// Positions for exactly one id.
    pub fn single(&mut self, file: &Arc<RecordFile<R>>, id: u64) {
        self.attach(file);
        self.next_id = id;
        self.end = id.saturating_add(1);
        self.high_mark = file.high_id();
        self.mode = Mode::Single;
    }

    fn attach(&mut self, file: &Arc<RecordFile<R>>) {
        let same = self
            .file
            .as_ref()
            .map(|current| Arc::ptr_eq(current, file))
            .unwrap_or(false);
        if !same {
            self.page.release();
            self.file = Some(Arc::clone(file));
        }
        self.current = None;
    }

    /// Advances to the next in-use record.
    pub fn next(&mut self) -> bool {
        let file = match (&self.file, self.mode) {
            (Some(file), Mode::Scan | Mode::Single) => Arc::clone(file),
            _ => return false,
        };
        loop {
            if self.next_id >= self.end {
                self.exhaust();
                return false;
            }
            if self.next_id >= self.high_mark {
                if self.mode == Mode::Single {
                    self.exhaust();
                    return false;
                }
                self.high_mark = file.high_id();
                if self.next_id >= self.high_mark {
                    self.exhaust();
                    return false;
                }
            }
            let id = self.next_id;
            self.next_id += 1;
            if self.page.read(&file, id, &mut self.record) && self.record.in_use() {
                self.current = Some(id);
                return true;
            }
        }
    }

    fn exhaust(&mut self) {
        self.current = None;
        self.mode = Mode::Idle;
    }

    /// Id of the current record.
    pub fn entity(&self) -> Option<u64> {
        self.current
    }

    /// The current record; meaningful only after `next` returned true.
    pub fn record(&self) -> &R {
        &self.record
    }

    /// High mark the cursor last observed.
    pub fn high_mark(&self) -> u64 {
        self.high_mark
    }

    /// Releases the page handle and file reference. Idempotent.
    pub fn close(&mut self) {
        self.page.release();
        self.file = None;
        self.current = None;
        self.mode = Mode::Idle;
    }
}

impl RecordCursor<NodeRecord> {
    /// Current node id.
    pub fn node(&self) -> Option<NodeId> {
        self.current.map(NodeId)
    }

    /// Labels of the current node.
    pub fn labels(&self) -> &[LabelId] {
        &self.record.labels
    }
}

impl RecordCursor<EdgeRecord> {
    /// Current edge id.
    pub fn edge(&self) -> Option<EdgeId> {
        self.current.map(EdgeId)
    }
}

/// Walks a property chain.
pub struct StorePropertyCursor {
    file: Option<Arc<RecordFile<PropRecord>>>,
    page: PageCursor<PropRecord>,
    record: PropRecord,
    next: Option<PropRecId>,
    positioned: bool,
    steps: u64,
}

impl Default for StorePropertyCursor {
    fn default() -> Self {
        Self {
            file: None,
            page: PageCursor::default(),
            record: PropRecord::default(),
            next: None,
            positioned: false,
            steps: 0,
        }
    }
}

impl StorePropertyCursor {
    /// Positions before the first record of the chain starting at `first`.
    pub fn init(&mut self, file: &Arc<RecordFile<PropRecord>>, first: Option<PropRecId>) {
        if !self.file.as_ref().map(|f| Arc::ptr_eq(f, file)).unwrap_or(false) {
            self.page.release();
            self.file = Some(Arc::clone(file));
        }
        self.next = first;
        self.positioned = false;
        self.steps = 0;
    }

    /// Advances along the chain.
    pub fn next(&mut self) -> Result<bool> {
        let file = match &self.file {
            Some(file) => file,
            None => return Ok(false),
        };
        let id = match self.next.take() {
            Some(id) => id,
            None => {
                self.positioned = false;
                return Ok(false);
            }
        };
        self.steps += 1;
        if self.steps > file.high_id() {
            return Err(SombraError::Corruption("property chain cycle"));
        }
        if !self.page.read(file, id.0, &mut self.record) || !self.record.in_use {
            return Err(SombraError::Corruption("property chain points at unused record"));
        }
        self.next = self.record.next;
        self.positioned = true;
        Ok(true)
    }

    /// Key of the current property.
    pub fn key(&self) -> PropId {
        self.record.key
    }

    /// Value of the current property.
    pub fn value(&self) -> &PropValue {
        &self.record.value
    }

    /// Whether the cursor sits on a property.
    pub fn is_positioned(&self) -> bool {
        self.positioned
    }

    /// Releases the page handle. Idempotent.
    pub fn close(&mut self) {
        self.page.release();
        self.file = None;
        self.next = None;
        self.positioned = false;
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum GroupChain {
    Out,
    In,
    Loop,
}

#[derive(Clone, Copy, Debug)]
enum TraversalState {
    Idle,
    Chain {
        next: Option<EdgeId>,
    },
    Groups {
        group: Option<GroupId>,
        chain: GroupChain,
        next: Option<EdgeId>,
    },
}

/// Walks the edges of one node, through its direct chain or its groups.
pub struct StoreEdgeTraversal {
    edges: Option<Arc<RecordFile<EdgeRecord>>>,
    groups: Option<Arc<RecordFile<GroupRecord>>>,
    edge_page: PageCursor<EdgeRecord>,
    group_page: PageCursor<GroupRecord>,
    record: EdgeRecord,
    group: GroupRecord,
    node: NodeId,
    selection: EdgeSelection,
    state: TraversalState,
    current: Option<EdgeId>,
    steps: u64,
}

impl Default for StoreEdgeTraversal {
    fn default() -> Self {
        Self {
            edges: None,
            groups: None,
            edge_page: PageCursor::default(),
            group_page: PageCursor::default(),
            record: EdgeRecord::default(),
            group: GroupRecord::default(),
            node: NodeId(0),
            selection: EdgeSelection::all(),
            state: TraversalState::Idle,
            current: None,
            steps: 0,
        }
    }
}

impl StoreEdgeTraversal {
    /// Positions before the first edge of `node` matching `selection`.
    pub fn init(
        &mut self,
        edges: &Arc<RecordFile<EdgeRecord>>,
        groups: &Arc<RecordFile<GroupRecord>>,
        node: NodeId,
        start: EdgeRef,
        selection: EdgeSelection,
    ) {
        self.edge_page.release();
        self.group_page.release();
        self.edges = Some(Arc::clone(edges));
        self.groups = Some(Arc::clone(groups));
        self.node = node;
        self.selection = selection;
        self.current = None;
        self.steps = 0;
        self.state = match start {
            EdgeRef::None => TraversalState::Idle,
            EdgeRef::Direct(first) => TraversalState::Chain { next: Some(first) },
            EdgeRef::Group(first) => TraversalState::Groups {
                group: Some(first),
                chain: GroupChain::Loop,
                next: None,
            },
        };
    }

    /// Advances to the next selected edge.
    pub fn next(&mut self) -> Result<bool> {
        loop {
            match self.state {
                TraversalState::Idle => {
                    self.current = None;
                    return Ok(false);
                }
                TraversalState::Chain { next } => {
                    let id = match next {
                        Some(id) => id,
                        None => {
                            self.state = TraversalState::Idle;
                            continue;
                        }
                    };
                    self.load_edge(id)?;
                    let follow = self
                        .record
                        .next_for(self.node)
                        .ok_or(SombraError::Corruption("edge chain left its node"))?;
                    self.state = TraversalState::Chain { next: follow };
                    let rec = &self.record;
                    if self.selection.accepts_type(rec.ty)
                        && self.selection.accepts_direction(self.node.0, rec.src.0, rec.dst.0)
                    {
                        self.current = Some(id);
                        return Ok(true);
                    }
                }
                TraversalState::Groups { group, chain, next } => match next {
                    Some(id) => {
                        self.load_edge(id)?;
                        let follow = match chain {
                            GroupChain::Out | GroupChain::Loop => self.record.src_next,
                            GroupChain::In => self.record.dst_next,
                        };
                        self.state = TraversalState::Groups {
                            group,
                            chain,
                            next: follow,
                        };
                        self.current = Some(id);
                        return Ok(true);
                    }
                    None => self.advance_group_chain(group, chain)?,
                },
            }
        }
    }

    fn advance_group_chain(&mut self, group: Option<GroupId>, chain: GroupChain) -> Result<()> {
        let dir = self.selection.direction;
        let mut chain = chain;
        let mut group = group;
        loop {
            // Loop is the last chain of a group; moving on loads the next group.
            let next_chain = match chain {
                GroupChain::Loop => {
                    let gid = match group {
                        Some(gid) => gid,
                        None => {
                            self.state = TraversalState::Idle;
                            return Ok(());
                        }
                    };
                    self.load_group(gid)?;
                    group = self.group.next;
                    if !self.selection.accepts_type(self.group.ty) {
                        continue;
                    }
                    GroupChain::Out
                }
                GroupChain::Out => GroupChain::In,
                GroupChain::In => GroupChain::Loop,
            };
            chain = next_chain;
            let head = match chain {
                GroupChain::Out if dir.includes_out() => self.group.first_out,
                GroupChain::In if dir.includes_in() => self.group.first_in,
                GroupChain::Loop => self.group.first_loop,
                _ => None,
            };
            if head.is_some() {
                self.state = TraversalState::Groups {
                    group,
                    chain,
                    next: head,
                };
                return Ok(());
            }
        }
    }

    fn load_edge(&mut self, id: EdgeId) -> Result<()> {
        let file = self
            .edges
            .as_ref()
            .ok_or(SombraError::Usage("edge traversal not initialized"))?;
        self.steps += 1;
        if self.steps > file.high_id() {
            return Err(SombraError::Corruption("edge chain cycle"));
        }
        if !self.edge_page.read(file, id.0, &mut self.record) || !self.record.in_use {
            return Err(SombraError::Corruption("edge chain points at unused record"));
        }
        Ok(())
    }

    fn load_group(&mut self, id: GroupId) -> Result<()> {
        let file = self
            .groups
            .as_ref()
            .ok_or(SombraError::Usage("edge traversal not initialized"))?;
        if !self.group_page.read(file, id.0, &mut self.group) || !self.group.in_use {
            return Err(SombraError::Corruption("group chain points at unused record"));
        }
        if self.group.owner != self.node {
            return Err(SombraError::Corruption("group owned by another node"));
        }
        Ok(())
    }

    /// Current edge id.
    pub fn edge(&self) -> Option<EdgeId> {
        self.current
    }

    /// Current edge record.
    pub fn record(&self) -> &EdgeRecord {
        &self.record
    }

    /// Type of the current edge.
    pub fn edge_type(&self) -> TypeId {
        self.record.ty
    }

    /// Releases page handles. Idempotent.
    pub fn close(&mut self) {
        self.edge_page.release();
        self.group_page.release();
        self.edges = None;
        self.groups = None;
        self.current = None;
        self.state = TraversalState::Idle;
    }
}

/// Walks the per-type edge groups of a dense node.
pub struct StoreGroupCursor {
    file: Option<Arc<RecordFile<GroupRecord>>>,
    page: PageCursor<GroupRecord>,
    record: GroupRecord,
    node: NodeId,
    next: Option<GroupId>,
    current: Option<GroupId>,
    steps: u64,
}

impl Default for StoreGroupCursor {
    fn default() -> Self {
        Self {
            file: None,
            page: PageCursor::default(),
            record: GroupRecord::default(),
            node: NodeId(0),
            next: None,
            current: None,
            steps: 0,
        }
    }
}

impl StoreGroupCursor {
    /// Positions before the first group of `node`; sparse nodes have none.
    pub fn init(&mut self, file: &Arc<RecordFile<GroupRecord>>, node: NodeId, start: EdgeRef) {
        if !self.file.as_ref().map(|f| Arc::ptr_eq(f, file)).unwrap_or(false) {
            self.page.release();
            self.file = Some(Arc::clone(file));
        }
        self.node = node;
        self.current = None;
        self.steps = 0;
        self.next = match start {
            EdgeRef::Group(first) => Some(first),
            EdgeRef::None | EdgeRef::Direct(_) => None,
        };
    }

    /// Advances to the next group.
    pub fn next(&mut self) -> Result<bool> {
        let file = match &self.file {
            Some(file) => file,
            None => return Ok(false),
        };
        let id = match self.next.take() {
            Some(id) => id,
            None => {
                self.current = None;
                return Ok(false);
            }
        };
        self.steps += 1;
        if self.steps > file.high_id() {
            return Err(SombraError::Corruption("group chain cycle"));
        }
        if !self.page.read(file, id.0, &mut self.record) || !self.record.in_use {
            return Err(SombraError::Corruption("group chain points at unused record"));
        }
        if self.record.owner != self.node {
            return Err(SombraError::Corruption("group owned by another node"));
        }
        self.next = self.record.next;
        self.current = Some(id);
        Ok(true)
    }

    /// Current group id.
    pub fn group(&self) -> Option<GroupId> {
        self.current
    }

    /// Edge type of the current group.
    pub fn edge_type(&self) -> TypeId {
        self.record.ty
    }

    /// Current group record.
    pub fn record(&self) -> &GroupRecord {
        &self.record
    }

    /// Releases the page handle. Idempotent.
    pub fn close(&mut self) {
        self.page.release();
        self.file = None;
        self.next = None;
        self.current = None;
    }
}
