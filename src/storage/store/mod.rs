//! In-memory record store: paged record files, token indexes, value indexes and
//! the committed-write helpers that stand in for other transactions.

mod cursor;
mod file;
mod records;
mod refs;

pub use cursor::{
    RecordCursor, StoreEdgeCursor, StoreEdgeTraversal, StoreGroupCursor, StoreNodeCursor,
    StorePropertyCursor,
};
pub use file::{PageCursor, RecordFile, RecordPage};
pub use records::{EdgeRecord, GroupRecord, NodeRecord, PropRecord, Record};
pub use refs::{Direction, EdgeRef, EdgeSelection};

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use tracing::debug;

use crate::storage::index::{IndexDescriptor, TokenIndex, ValueIndex};
use crate::storage::options::CursorOptions;
use crate::types::{
    EdgeId, EntityKind, GroupId, IndexId, LabelId, NodeId, PropId, PropRecId, PropValue, Result,
    SombraError, TypeId,
};

/// Committed graph state shared by every transaction.
pub struct GraphStore {
    nodes: Arc<RecordFile<NodeRecord>>,
    edges: Arc<RecordFile<EdgeRecord>>,
    props: Arc<RecordFile<PropRecord>>,
    groups: Arc<RecordFile<GroupRecord>>,
    labels: Arc<TokenIndex>,
    types: Arc<TokenIndex>,
    indexes: RwLock<Vec<Arc<ValueIndex>>>,
    dense_threshold: usize,
    writer: Mutex<()>,
}

#[derive(Clone, Copy)]
enum ChainRole {
    Out,
    In,
    Loop,
}

impl GraphStore {
    /// Creates an empty store.
    pub fn new(options: &CursorOptions) -> Self {
        let per_page = options.records_per_page;
        Self {
            nodes: Arc::new(RecordFile::new("nodes", per_page)),
            edges: Arc::new(RecordFile::new("edges", per_page)),
            props: Arc::new(RecordFile::new("props", per_page)),
            groups: Arc::new(RecordFile::new("groups", per_page)),
            labels: Arc::new(TokenIndex::new(EntityKind::Node)),
            types: Arc::new(TokenIndex::new(EntityKind::Edge)),
            indexes: RwLock::new(Vec::new()),
            dense_threshold: options.dense_node_threshold.max(1),
            writer: Mutex::new(()),
        }
    }

    /// Node record file.
    pub fn nodes(&self) -> &Arc<RecordFile<NodeRecord>> {
        &self.nodes
    }

    /// Edge record file.
    pub fn edges(&self) -> &Arc<RecordFile<EdgeRecord>> {
        &self.edges
    }

    /// Property record file.
    pub fn props(&self) -> &Arc<RecordFile<PropRecord>> {
        &self.props
    }

    /// Edge group record file.
    pub fn groups(&self) -> &Arc<RecordFile<GroupRecord>> {
        &self.groups
    }

    /// Label index.
    pub fn label_index(&self) -> &Arc<TokenIndex> {
        &self.labels
    }

    /// Edge type index.
    pub fn type_index(&self) -> &Arc<TokenIndex> {
        &self.types
    }

    /// Committed live node count.
    pub fn node_count(&self) -> u64 {
        self.nodes.live_count()
    }

    /// Committed live edge count.
    pub fn edge_count(&self) -> u64 {
        self.edges.live_count()
    }

    /// Committed node count for `label`.
    pub fn label_count(&self, label: LabelId) -> u64 {
        self.labels.count(label.0)
    }

    /// Committed edge count for `ty`.
    pub fn type_count(&self, ty: TypeId) -> u64 {
        self.types.count(ty.0)
    }

    /// Looks up a value index.
    pub fn index(&self, id: IndexId) -> Result<Arc<ValueIndex>> {
        self.indexes
            .read()
            .iter()
            .find(|idx| idx.descriptor().id == id)
            .cloned()
            .ok_or(SombraError::NotFound)
    }

    /// Value indexes over `kind`.
    pub fn indexes_for(&self, kind: EntityKind) -> Vec<Arc<ValueIndex>> {
        self.indexes
            .read()
            .iter()
            .filter(|idx| idx.descriptor().entity == kind)
            .cloned()
            .collect()
    }

    /// Registers a value index and populates it from committed entities.
    pub fn create_index(&self, descriptor: IndexDescriptor) -> Result<Arc<ValueIndex>> {
        let _guard = self.writer.lock();
        if self
            .indexes
            .read()
            .iter()
            .any(|idx| idx.descriptor().id == descriptor.id)
        {
            return Err(SombraError::Invalid("index id already registered"));
        }
        let index = Arc::new(ValueIndex::new(descriptor));
        match index.descriptor().entity {
            EntityKind::Node => {
                let mut cursor = StoreNodeCursor::new();
                cursor.scan(&self.nodes);
                while cursor.next() {
                    let id = cursor.entity().unwrap_or_default();
                    let tuple = self.node_tuple(&index, cursor.record())?;
                    index.update(id, tuple);
                }
            }
            EntityKind::Edge => {
                let mut cursor = StoreEdgeCursor::new();
                cursor.scan(&self.edges);
                while cursor.next() {
                    let id = cursor.entity().unwrap_or_default();
                    let tuple = self.edge_tuple(&index, cursor.record())?;
                    index.update(id, tuple);
                }
            }
        }
        debug!(index = %index.descriptor().name, entries = index.count(), "store.create_index");
        self.indexes.write().push(Arc::clone(&index));
        Ok(index)
    }

    /// Reserves a node id without making the node visible.
    pub fn reserve_node_id(&self) -> NodeId {
        NodeId(self.nodes.append(NodeRecord::default()))
    }

    /// Reserves an edge id without making the edge visible.
    pub fn reserve_edge_id(&self) -> EdgeId {
        EdgeId(self.edges.append(EdgeRecord::default()))
    }

    /// Commits a new node.
    pub fn create_node(&self, labels: &[LabelId]) -> Result<NodeId> {
        let _guard = self.writer.lock();
        let mut sorted: SmallVec<[LabelId; 4]> = labels.iter().copied().collect();
        sorted.sort();
        sorted.dedup();
        let record = NodeRecord {
            in_use: true,
            labels: sorted,
            ..NodeRecord::default()
        };
        let id = self.nodes.append(record.clone());
        for label in &record.labels {
            self.labels.insert(label.0, id);
        }
        self.reindex_node(id, &record)?;
        Ok(NodeId(id))
    }

    /// Commits a label on an existing node. Returns false if already present.
    pub fn add_label(&self, node: NodeId, label: LabelId) -> Result<bool> {
        let _guard = self.writer.lock();
        let mut record = self.nodes.get_live(node.0)?;
        match record.labels.binary_search(&label) {
            Ok(_) => Ok(false),
            Err(pos) => {
                record.labels.insert(pos, label);
                self.nodes.update(node.0, record.clone())?;
                self.labels.insert(label.0, node.0);
                self.reindex_node(node.0, &record)?;
                Ok(true)
            }
        }
    }

    /// Commits a label removal. Returns false if the label was absent.
    pub fn remove_label(&self, node: NodeId, label: LabelId) -> Result<bool> {
        let _guard = self.writer.lock();
        let mut record = self.nodes.get_live(node.0)?;
        match record.labels.binary_search(&label) {
            Err(_) => Ok(false),
            Ok(pos) => {
                record.labels.remove(pos);
                self.nodes.update(node.0, record.clone())?;
                self.labels.remove(label.0, node.0);
                self.reindex_node(node.0, &record)?;
                Ok(true)
            }
        }
    }

    /// Commits a node property.
    pub fn set_node_property(&self, node: NodeId, prop: PropId, value: PropValue) -> Result<()> {
        let _guard = self.writer.lock();
        let mut record = self.nodes.get_live(node.0)?;
        if let Some(head) = self.write_property(record.first_prop, prop, value)? {
            record.first_prop = Some(head);
            self.nodes.update(node.0, record.clone())?;
        }
        self.reindex_node(node.0, &record)
    }

    /// Commits a node property removal. Returns false if it was absent.
    pub fn remove_node_property(&self, node: NodeId, prop: PropId) -> Result<bool> {
        let _guard = self.writer.lock();
        let mut record = self.nodes.get_live(node.0)?;
        let (head, removed) = self.unlink_property(record.first_prop, prop)?;
        if removed {
            record.first_prop = head;
            self.nodes.update(node.0, record.clone())?;
            self.reindex_node(node.0, &record)?;
        }
        Ok(removed)
    }

    /// Commits an edge property.
    pub fn set_edge_property(&self, edge: EdgeId, prop: PropId, value: PropValue) -> Result<()> {
        let _guard = self.writer.lock();
        let mut record = self.edges.get_live(edge.0)?;
        if let Some(head) = self.write_property(record.first_prop, prop, value)? {
            record.first_prop = Some(head);
            self.edges.update(edge.0, record.clone())?;
        }
        self.reindex_edge(edge.0, &record)
    }

    /// Commits a new edge, converting endpoints to grouped chains once they
    /// reach the dense threshold.
    pub fn create_edge(&self, src: NodeId, ty: TypeId, dst: NodeId) -> Result<EdgeId> {
        let _guard = self.writer.lock();
        let mut src_rec = self.nodes.get_live(src.0)?;
        let is_loop = src == dst;
        let mut dst_rec = if is_loop {
            src_rec.clone()
        } else {
            self.nodes.get_live(dst.0)?
        };
        let src_role = if is_loop { ChainRole::Loop } else { ChainRole::Out };
        let src_next = self.chain_head(src, &mut src_rec, ty, src_role)?;
        let dst_next = if is_loop {
            None
        } else {
            self.chain_head(dst, &mut dst_rec, ty, ChainRole::In)?
        };
        let id = EdgeId(self.edges.append(EdgeRecord {
            in_use: true,
            src,
            dst,
            ty,
            first_prop: None,
            src_next,
            dst_next,
        }));
        self.set_chain_head(&mut src_rec, ty, src_role, Some(id))?;
        src_rec.degree += 1;
        self.nodes.update(src.0, src_rec.clone())?;
        if !is_loop {
            self.set_chain_head(&mut dst_rec, ty, ChainRole::In, Some(id))?;
            dst_rec.degree += 1;
            self.nodes.update(dst.0, dst_rec.clone())?;
        }
        self.types.insert(ty.0, id.0);
        for node in [src, dst] {
            let record = self.nodes.get_live(node.0)?;
            if !record.is_dense() && record.degree as usize >= self.dense_threshold {
                self.convert_to_dense(node, record)?;
            }
            if is_loop {
                break;
            }
        }
        let record = self.edges.get_live(id.0)?;
        self.reindex_edge(id.0, &record)?;
        Ok(id)
    }

    /// Commits an edge deletion. Returns false if the edge was already gone.
    pub fn delete_edge(&self, edge: EdgeId) -> Result<bool> {
        let _guard = self.writer.lock();
        let record = match self.edges.get(edge.0) {
            Some(record) if record.in_use => record,
            _ => return Ok(false),
        };
        self.unlink_edge(record.src, edge, &record)?;
        if !record.is_loop() {
            self.unlink_edge(record.dst, edge, &record)?;
        }
        self.free_properties(record.first_prop)?;
        self.edges.update(edge.0, EdgeRecord::default())?;
        self.types.remove(record.ty.0, edge.0);
        for index in self.indexes_for(EntityKind::Edge) {
            index.update(edge.0, None);
        }
        Ok(true)
    }

    /// Commits a node deletion. The node must have no edges left.
    pub fn delete_node(&self, node: NodeId) -> Result<bool> {
        let _guard = self.writer.lock();
        let record = match self.nodes.get(node.0) {
            Some(record) if record.in_use => record,
            _ => return Ok(false),
        };
        if record.degree > 0 {
            return Err(SombraError::Invalid("node still has edges"));
        }
        if let EdgeRef::Group(first) = record.edges {
            let mut next = Some(first);
            while let Some(gid) = next {
                let group = self.groups.get_live(gid.0)?;
                next = group.next;
                self.groups.update(gid.0, GroupRecord::default())?;
            }
        }
        self.free_properties(record.first_prop)?;
        for label in &record.labels {
            self.labels.remove(label.0, node.0);
        }
        self.nodes.update(node.0, NodeRecord::default())?;
        for index in self.indexes_for(EntityKind::Node) {
            index.update(node.0, None);
        }
        Ok(true)
    }

    /// Reads one committed property of a chain.
    pub fn property(&self, first: Option<PropRecId>, prop: PropId) -> Result<Option<PropValue>> {
        let mut cursor = StorePropertyCursor::default();
        cursor.init(&self.props, first);
        while cursor.next()? {
            if cursor.key() == prop {
                return Ok(Some(cursor.value().clone()));
            }
        }
        Ok(None)
    }

    fn node_tuple(&self, index: &ValueIndex, record: &NodeRecord) -> Result<Option<Vec<PropValue>>> {
        let desc = index.descriptor();
        if !record.in_use || !desc.matches_tokens(record.labels.iter().map(|l| l.0)) {
            return Ok(None);
        }
        self.tuple(&desc.props, record.first_prop)
    }

    fn edge_tuple(&self, index: &ValueIndex, record: &EdgeRecord) -> Result<Option<Vec<PropValue>>> {
        let desc = index.descriptor();
        if !record.in_use || !desc.matches_tokens([record.ty.0]) {
            return Ok(None);
        }
        self.tuple(&desc.props, record.first_prop)
    }

    fn tuple(&self, props: &[PropId], first: Option<PropRecId>) -> Result<Option<Vec<PropValue>>> {
        let mut slots: Vec<Option<PropValue>> = vec![None; props.len()];
        let mut cursor = StorePropertyCursor::default();
        cursor.init(&self.props, first);
        while cursor.next()? {
            if let Some(pos) = props.iter().position(|p| *p == cursor.key()) {
                slots[pos] = Some(cursor.value().clone());
            }
        }
        Ok(slots.into_iter().collect())
    }

    fn reindex_node(&self, id: u64, record: &NodeRecord) -> Result<()> {
        for index in self.indexes_for(EntityKind::Node) {
            let tuple = self.node_tuple(&index, record)?;
            index.update(id, tuple);
        }
        Ok(())
    }

    fn reindex_edge(&self, id: u64, record: &EdgeRecord) -> Result<()> {
        for index in self.indexes_for(EntityKind::Edge) {
            let tuple = self.edge_tuple(&index, record)?;
            index.update(id, tuple);
        }
        Ok(())
    }

    /// Updates `prop` in place or prepends it; returns the new head if it changed.
    fn write_property(
        &self,
        first: Option<PropRecId>,
        prop: PropId,
        value: PropValue,
    ) -> Result<Option<PropRecId>> {
        let mut next = first;
        while let Some(id) = next {
            let mut record = self.props.get_live(id.0)?;
            if record.key == prop {
                record.value = value;
                self.props.update(id.0, record)?;
                return Ok(None);
            }
            next = record.next;
        }
        let id = self.props.append(PropRecord {
            in_use: true,
            key: prop,
            value,
            next: first,
        });
        Ok(Some(PropRecId(id)))
    }

    fn unlink_property(
        &self,
        first: Option<PropRecId>,
        prop: PropId,
    ) -> Result<(Option<PropRecId>, bool)> {
        let mut prev: Option<(PropRecId, PropRecord)> = None;
        let mut next = first;
        while let Some(id) = next {
            let record = self.props.get_live(id.0)?;
            if record.key == prop {
                self.props.update(id.0, PropRecord::default())?;
                return match prev {
                    None => Ok((record.next, true)),
                    Some((prev_id, mut prev_rec)) => {
                        prev_rec.next = record.next;
                        self.props.update(prev_id.0, prev_rec)?;
                        Ok((first, true))
                    }
                };
            }
            next = record.next;
            prev = Some((id, record));
        }
        Ok((first, false))
    }

    fn free_properties(&self, first: Option<PropRecId>) -> Result<()> {
        let mut next = first;
        while let Some(id) = next {
            let record = self.props.get_live(id.0)?;
            next = record.next;
            self.props.update(id.0, PropRecord::default())?;
        }
        Ok(())
    }

    /// Current head of the chain a new edge of `ty` joins; creates the group of a
    /// dense node on demand.
    fn chain_head(
        &self,
        node: NodeId,
        record: &mut NodeRecord,
        ty: TypeId,
        role: ChainRole,
    ) -> Result<Option<EdgeId>> {
        match record.edges {
            EdgeRef::None => Ok(None),
            EdgeRef::Direct(head) => Ok(Some(head)),
            EdgeRef::Group(_) => {
                let gid = self.group_for(node, record, ty)?;
                let group = self.groups.get_live(gid.0)?;
                Ok(match role {
                    ChainRole::Out => group.first_out,
                    ChainRole::In => group.first_in,
                    ChainRole::Loop => group.first_loop,
                })
            }
        }
    }

    fn set_chain_head(
        &self,
        record: &mut NodeRecord,
        ty: TypeId,
        role: ChainRole,
        head: Option<EdgeId>,
    ) -> Result<()> {
        match record.edges {
            EdgeRef::None | EdgeRef::Direct(_) => {
                record.edges = head.map(EdgeRef::Direct).unwrap_or(EdgeRef::None);
                Ok(())
            }
            EdgeRef::Group(first) => {
                let mut next = Some(first);
                while let Some(gid) = next {
                    let mut group = self.groups.get_live(gid.0)?;
                    if group.ty == ty {
                        match role {
                            ChainRole::Out => group.first_out = head,
                            ChainRole::In => group.first_in = head,
                            ChainRole::Loop => group.first_loop = head,
                        }
                        return self.groups.update(gid.0, group);
                    }
                    next = group.next;
                }
                Err(SombraError::Corruption("edge group missing for type"))
            }
        }
    }

    /// Finds or inserts the group of `ty`, keeping groups sorted by type.
    fn group_for(&self, node: NodeId, record: &mut NodeRecord, ty: TypeId) -> Result<GroupId> {
        let first = match record.edges {
            EdgeRef::Group(first) => first,
            _ => return Err(SombraError::Corruption("group lookup on sparse node")),
        };
        let mut prev: Option<(GroupId, GroupRecord)> = None;
        let mut next = Some(first);
        while let Some(gid) = next {
            let group = self.groups.get_live(gid.0)?;
            if group.ty == ty {
                return Ok(gid);
            }
            if group.ty > ty {
                break;
            }
            next = group.next;
            prev = Some((gid, group));
        }
        let gid = GroupId(self.groups.append(GroupRecord {
            in_use: true,
            owner: node,
            ty,
            first_out: None,
            first_in: None,
            first_loop: None,
            next,
        }));
        match prev {
            None => {
                record.edges = EdgeRef::Group(gid);
                self.nodes.update(node.0, record.clone())?;
            }
            Some((prev_id, mut prev_rec)) => {
                prev_rec.next = Some(gid);
                self.groups.update(prev_id.0, prev_rec)?;
            }
        }
        Ok(gid)
    }

    fn convert_to_dense(&self, node: NodeId, mut record: NodeRecord) -> Result<()> {
        let mut chain = Vec::new();
        let mut next = match record.edges {
            EdgeRef::Direct(head) => Some(head),
            _ => None,
        };
        while let Some(id) = next {
            let edge = self.edges.get_live(id.0)?;
            next = edge
                .next_for(node)
                .ok_or(SombraError::Corruption("edge chain left its node"))?;
            chain.push((id, edge));
        }
        debug!(node = node.0, edges = chain.len(), "store.convert_to_dense");
        record.edges = EdgeRef::None;
        // Relinking in reverse keeps every chain in its original order.
        for (id, mut edge) in chain.into_iter().rev() {
            let role = if edge.is_loop() {
                ChainRole::Loop
            } else if edge.src == node {
                ChainRole::Out
            } else {
                ChainRole::In
            };
            if record.edges == EdgeRef::None {
                let gid = GroupId(self.groups.append(GroupRecord {
                    in_use: true,
                    owner: node,
                    ty: edge.ty,
                    first_out: None,
                    first_in: None,
                    first_loop: None,
                    next: None,
                }));
                record.edges = EdgeRef::Group(gid);
            }
            let head = self.chain_head(node, &mut record, edge.ty, role)?;
            if edge.src == node {
                edge.src_next = head;
            } else {
                edge.dst_next = head;
            }
            self.edges.update(id.0, edge.clone())?;
            self.set_chain_head(&mut record, edge.ty, role, Some(id))?;
        }
        self.nodes.update(node.0, record)
    }

    fn unlink_edge(&self, node: NodeId, edge: EdgeId, target: &EdgeRecord) -> Result<()> {
        let mut record = self.nodes.get_live(node.0)?;
        let role = if target.is_loop() {
            ChainRole::Loop
        } else if target.src == node {
            ChainRole::Out
        } else {
            ChainRole::In
        };
        let head = match record.edges {
            EdgeRef::None => return Err(SombraError::Corruption("edge missing from chain")),
            EdgeRef::Direct(head) => Some(head),
            EdgeRef::Group(_) => self.chain_head(node, &mut record, target.ty, role)?,
        };
        let target_next = target
            .next_for(node)
            .ok_or(SombraError::Corruption("edge chain left its node"))?;
        if head == Some(edge) {
            self.set_chain_head(&mut record, target.ty, role, target_next)?;
        } else {
            let mut next = head;
            loop {
                let id = next.ok_or(SombraError::Corruption("edge missing from chain"))?;
                let mut prev = self.edges.get_live(id.0)?;
                let after = prev
                    .next_for(node)
                    .ok_or(SombraError::Corruption("edge chain left its node"))?;
                if after == Some(edge) {
                    if prev.src == node {
                        prev.src_next = target_next;
                    } else {
                        prev.dst_next = target_next;
                    }
                    self.edges.update(id.0, prev)?;
                    break;
                }
                next = after;
            }
        }
        record.degree = record.degree.saturating_sub(1);
        self.nodes.update(node.0, record)
    }
}
