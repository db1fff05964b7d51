#![allow(missing_docs)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;

use sombra_cursor::storage::cursor::{
    BatchedScan, Cursor, EdgeScanCursor, EdgeTypeIndexCursor, NodeCursor, NodeLabelIndexCursor,
    NodeValueIndexCursor, PartitionedScan, RangeCursor,
};
use sombra_cursor::storage::index::{
    IndexCapability, IndexDescriptor, IndexOrder, IndexQueryConstraints, PropertyPredicate,
};
use sombra_cursor::storage::security::AllowAll;
use sombra_cursor::types::{
    EntityKind, IndexId, LabelId, NodeId, PropId, PropValue, Result, SombraError, TypeId,
};
use sombra_cursor::{CursorOptions, Kernel};

const WORKERS: usize = 4;
const TAGGED: LabelId = LabelId(3);
const RARE: LabelId = LabelId(4);
const SCORE: PropId = PropId(1);
const SCORES: IndexId = IndexId(5);

fn populate(kernel: &Kernel, count: usize) -> Result<Vec<NodeId>> {
    (0..count)
        .map(|i| {
            let labels: &[LabelId] = if i % 3 == 0 { &[TAGGED] } else { &[] };
            kernel.store().create_node(labels)
        })
        .collect()
}

/// Drains one partition per reservation; returns what each reservation saw.
fn drain_partitions<C, F>(scan: &PartitionedScan<C>, mut cursor: C, id: F) -> Result<Vec<Vec<u64>>>
where
    C: RangeCursor,
    F: Fn(&C) -> Option<u64>,
{
    let mut parts = Vec::new();
    while scan.reserve_partition(&mut cursor)? {
        let mut part = Vec::new();
        while cursor.next()? {
            part.extend(id(&cursor));
        }
        parts.push(part);
    }
    cursor.close();
    Ok(parts)
}

fn node_id(cursor: &NodeCursor) -> Option<u64> {
    cursor.node_reference().map(|n| n.0)
}

fn assert_exactly_once(seen: Vec<u64>, expected: impl IntoIterator<Item = u64>) {
    let unique: BTreeSet<u64> = seen.iter().copied().collect();
    assert_eq!(unique.len(), seen.len(), "an entity was produced twice");
    assert_eq!(unique, expected.into_iter().collect::<BTreeSet<u64>>());
}

#[test]
fn ten_nodes_in_four_partitions() -> Result<()> {
    let kernel = Kernel::new(CursorOptions::default());
    populate(&kernel, 10)?;
    let tx = kernel.begin(Arc::new(AllowAll));

    let scan = tx.read().all_nodes_scan_partitioned(4)?;
    assert_eq!(scan.partitions(), 4);
    assert_eq!(scan.batch_size(), 3);
    let last = scan.layout()[3];
    assert_eq!(last.end, None);
    let sizes: Vec<usize> = drain_partitions(&scan, NodeCursor::new(), node_id)?
        .iter()
        .map(Vec::len)
        .collect();
    assert_eq!(sizes, vec![3, 3, 3, 1]);

    // Entities committed after sizing land in the open-ended final partition.
    let scan = tx.read().all_nodes_scan_partitioned(4)?;
    let late = kernel.store().create_node(&[])?;
    let parts = drain_partitions(&scan, NodeCursor::new(), node_id)?;
    assert_eq!(parts.iter().map(Vec::len).collect::<Vec<_>>(), vec![3, 3, 3, 2]);
    assert!(parts[3].contains(&late.0));
    tx.close()
}

#[test]
fn concurrent_partitions_cover_every_node_once() -> Result<()> {
    let kernel = Kernel::new(CursorOptions::default());
    let ids = populate(&kernel, 1000)?;
    let tx = kernel.begin(Arc::new(AllowAll));
    let scan = tx.read().all_nodes_scan_partitioned(7)?;

    let seen: Vec<u64> = thread::scope(|s| {
        let workers: Vec<_> = (0..WORKERS)
            .map(|_| s.spawn(|| drain_partitions(&scan, NodeCursor::new(), node_id)))
            .collect();
        workers
            .into_iter()
            .map(|w| w.join().expect("worker panicked"))
            .collect::<Result<Vec<_>>>()
    })?
    .into_iter()
    .flatten()
    .flatten()
    .collect();
    assert_exactly_once(seen, ids.iter().map(|n| n.0));
    tx.close()
}

#[test]
fn label_and_type_partitions_cover_their_members() -> Result<()> {
    let kernel = Kernel::new(CursorOptions::default());
    let ids = populate(&kernel, 100)?;
    let store = kernel.store();
    let mut edges = Vec::new();
    for pair in ids.windows(2).take(40) {
        edges.push(store.create_edge(pair[0], TypeId(1), pair[1])?.0);
        store.create_edge(pair[1], TypeId(2), pair[0])?;
    }
    let tx = kernel.begin(Arc::new(AllowAll));

    let scan = tx.read().node_label_scan_partitioned(TAGGED, 5)?;
    assert_eq!(scan.partitions(), 5);
    let parts = drain_partitions(&scan, NodeLabelIndexCursor::new(), |c| {
        c.node_reference().map(|n| n.0)
    })?;
    let tagged = ids.iter().step_by(3).map(|n| n.0);
    assert_exactly_once(parts.into_iter().flatten().collect(), tagged);

    let scan = tx.read().edge_type_scan_partitioned(TypeId(1), 3)?;
    let parts = drain_partitions(&scan, EdgeTypeIndexCursor::new(), |c| {
        c.edge_reference().map(|e| e.0)
    })?;
    assert_exactly_once(parts.into_iter().flatten().collect(), edges);

    let scan = tx.read().all_edges_scan_partitioned(6)?;
    let parts = drain_partitions(&scan, EdgeScanCursor::new(), |c| c.edge_reference().map(|e| e.0))?;
    assert_eq!(parts.iter().map(Vec::len).sum::<usize>(), 80);
    tx.close()
}

#[test]
fn partitioned_scans_reject_pending_changes_and_zero_partitions() -> Result<()> {
    let kernel = Kernel::new(CursorOptions::default());
    populate(&kernel, 4)?;
    let tx = kernel.begin(Arc::new(AllowAll));
    assert!(matches!(
        tx.read().all_nodes_scan_partitioned(0),
        Err(SombraError::Invalid(_))
    ));
    let scan = tx.read().all_nodes_scan_partitioned(2)?;
    tx.write().node_create(&[])?;
    let mut cursor = NodeCursor::new();
    assert!(matches!(
        scan.reserve_partition(&mut cursor),
        Err(SombraError::Unsupported(_))
    ));
    cursor.close();
    tx.close()
}

#[test]
fn concurrent_batches_include_transaction_changes_once() -> Result<()> {
    let kernel = Kernel::new(CursorOptions::default());
    let committed = populate(&kernel, 300)?;
    let tx = kernel.begin(Arc::new(AllowAll));
    let mut visible: BTreeSet<u64> = committed.iter().map(|n| n.0).collect();
    for _ in 0..57 {
        visible.insert(tx.write().node_create(&[TAGGED])?.0);
    }
    for node in committed.iter().step_by(11) {
        assert!(tx.write().node_delete(*node)?);
        visible.remove(&node.0);
    }

    let batches: BatchedScan<NodeCursor> = tx.read().all_nodes_batched();
    assert_eq!(batches.added_len(), 57);
    let seen: Vec<u64> = thread::scope(|s| {
        let workers: Vec<_> = (0..WORKERS)
            .map(|worker| {
                let batches = &batches;
                s.spawn(move || -> Result<Vec<u64>> {
                    let mut cursor = NodeCursor::new();
                    let mut out = Vec::new();
                    while batches.reserve_batch(&mut cursor, 16 + worker)? {
                        while cursor.next()? {
                            out.extend(node_id(&cursor));
                        }
                    }
                    cursor.close();
                    Ok(out)
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|w| w.join().expect("worker panicked"))
            .collect::<Result<Vec<_>>>()
    })?
    .into_iter()
    .flatten()
    .collect();
    assert_exactly_once(seen, visible);
    tx.close()
}

#[test]
fn edge_batches_cover_added_and_committed_edges() -> Result<()> {
    let kernel = Kernel::new(CursorOptions::default());
    let nodes = populate(&kernel, 20)?;
    let store = kernel.store();
    let mut visible = BTreeSet::new();
    for pair in nodes.windows(2) {
        visible.insert(store.create_edge(pair[0], TypeId(1), pair[1])?.0);
    }
    let tx = kernel.begin(Arc::new(AllowAll));
    for pair in nodes.windows(3) {
        visible.insert(tx.write().edge_create(pair[2], TypeId(2), pair[0])?.0);
    }

    let batches = tx.read().all_edges_batched();
    let mut cursor = EdgeScanCursor::new();
    let mut seen = Vec::new();
    while batches.reserve_batch(&mut cursor, 5)? {
        while cursor.next()? {
            seen.extend(cursor.edge_reference().map(|e| e.0));
        }
    }
    cursor.close();
    assert_exactly_once(seen, visible);
    tx.close()
}

#[test]
fn multi_label_scans_share_one_partition_count() -> Result<()> {
    let kernel = Kernel::new(CursorOptions::default());
    let ids = populate(&kernel, 100)?;
    let rare: Vec<u64> = ids.iter().skip(1).step_by(40).map(|n| n.0).collect();
    for node in &rare {
        kernel.store().add_label(NodeId(*node), RARE)?;
    }
    let tx = kernel.begin(Arc::new(AllowAll));

    let scans = tx.read().node_label_scans(&[TAGGED, RARE], 6)?;
    assert_eq!(scans.len(), 2);
    assert!(scans.iter().all(|scan| scan.partitions() == 6));
    let tagged = drain_partitions(&scans[0], NodeLabelIndexCursor::new(), |c| {
        c.node_reference().map(|n| n.0)
    })?;
    assert_exactly_once(tagged.into_iter().flatten().collect(), ids.iter().step_by(3).map(|n| n.0));
    let few = drain_partitions(&scans[1], NodeLabelIndexCursor::new(), |c| {
        c.node_reference().map(|n| n.0)
    })?;
    assert_eq!(few.len(), 6);
    assert!(few.iter().any(Vec::is_empty), "three members over six partitions");
    assert_exactly_once(few.into_iter().flatten().collect(), rare);

    let store = kernel.store();
    let knows = store.create_edge(ids[0], TypeId(1), ids[1])?;
    let scans = tx.read().edge_type_scans(&[TypeId(1), TypeId(9)], 3)?;
    assert!(scans.iter().all(|scan| scan.partitions() == 1));
    let parts = drain_partitions(&scans[0], EdgeTypeIndexCursor::new(), |c| {
        c.edge_reference().map(|e| e.0)
    })?;
    assert_eq!(parts, vec![vec![knows.0]]);
    assert!(tx.read().node_label_scans(&[], 4)?.is_empty());
    tx.close()
}

fn scored(kernel: &Kernel, count: usize) -> Result<Vec<NodeId>> {
    kernel.store().create_index(IndexDescriptor {
        id: SCORES,
        name: "tagged_score".into(),
        entity: EntityKind::Node,
        tokens: vec![TAGGED.0],
        props: vec![SCORE],
        unique: false,
        capability: IndexCapability::default(),
    })?;
    let ids = populate(kernel, count)?;
    for (i, node) in ids.iter().enumerate() {
        // Scores run against id order so key slices and id ranges differ.
        let score = (count - i) as i64;
        kernel.store().set_node_property(*node, SCORE, PropValue::Int(score))?;
    }
    Ok(ids)
}

fn value_id(cursor: &NodeValueIndexCursor) -> Option<u64> {
    cursor.node_reference().map(|n| n.0)
}

#[test]
fn index_seek_partitions_cover_every_hit_once() -> Result<()> {
    let kernel = Kernel::new(CursorOptions::default());
    let ids = scored(&kernel, 300)?;
    let tx = kernel.begin(Arc::new(AllowAll));
    let above = PropertyPredicate::range(
        SCORE,
        std::ops::Bound::Excluded(PropValue::Int(100)),
        std::ops::Bound::Unbounded,
    );
    let expected: Vec<u64> = ids
        .iter()
        .enumerate()
        .filter(|(i, _)| i % 3 == 0 && 300 - i > 100)
        .map(|(_, n)| n.0)
        .collect();

    let scan = tx.read().node_index_seek_partitioned(
        SCORES,
        std::slice::from_ref(&above),
        IndexQueryConstraints::unconstrained(),
        5,
    )?;
    assert_eq!(scan.partitions(), 5);
    let seen: Vec<u64> = thread::scope(|s| {
        let workers: Vec<_> = (0..WORKERS)
            .map(|_| s.spawn(|| drain_partitions(&scan, NodeValueIndexCursor::new(), value_id)))
            .collect();
        workers
            .into_iter()
            .map(|w| w.join().expect("worker panicked"))
            .collect::<Result<Vec<_>>>()
    })?
    .into_iter()
    .flatten()
    .flatten()
    .collect();
    assert_exactly_once(seen, expected);

    let scan = tx
        .read()
        .node_index_scan_partitioned(SCORES, IndexQueryConstraints::unconstrained(), 3)?;
    let parts = drain_partitions(&scan, NodeValueIndexCursor::new(), value_id)?;
    assert_eq!(parts.len(), 3);
    assert_exactly_once(parts.into_iter().flatten().collect(), ids.iter().step_by(3).map(|n| n.0));
    tx.close()
}

#[test]
fn index_seek_partitions_reject_orders_kinds_and_pending_changes() -> Result<()> {
    let kernel = Kernel::new(CursorOptions::default());
    scored(&kernel, 30)?;
    let tx = kernel.begin(Arc::new(AllowAll));
    let any = [PropertyPredicate::Exists { prop: SCORE }];
    assert!(matches!(
        tx.read().node_index_seek_partitioned(
            SCORES,
            &any,
            IndexQueryConstraints::ordered(IndexOrder::Ascending),
            2,
        ),
        Err(SombraError::Unsupported(_))
    ));
    assert!(matches!(
        tx.read()
            .edge_index_seek_partitioned(SCORES, &any, IndexQueryConstraints::unconstrained(), 2),
        Err(SombraError::IndexNotApplicable(_))
    ));

    let scan = tx
        .read()
        .node_index_seek_partitioned(SCORES, &any, IndexQueryConstraints::unconstrained(), 2)?;
    tx.write().node_create(&[TAGGED])?;
    let mut cursor = NodeValueIndexCursor::new();
    assert!(matches!(
        scan.reserve_partition(&mut cursor),
        Err(SombraError::Unsupported(_))
    ));
    cursor.close();
    tx.close()
}
