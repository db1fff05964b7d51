#![allow(missing_docs)]

use std::collections::BTreeSet;
use std::sync::Arc;

use sombra_cursor::storage::cursor::{Cursor, EdgeScanCursor, NodeCursor, NodeLabelIndexCursor};
use sombra_cursor::storage::index::IndexOrder;
use sombra_cursor::storage::security::AllowAll;
use sombra_cursor::storage::store::{Direction, EdgeSelection};
use sombra_cursor::types::{EdgeId, LabelId, NodeId, Result, TypeId};
use sombra_cursor::{CursorOptions, Kernel};

const PERSON: LabelId = LabelId(1);
const KNOWS: TypeId = TypeId(7);

fn kernel() -> Kernel {
    Kernel::new(CursorOptions::default().track_cursor_close(true))
}

fn drain_nodes(cursor: &mut NodeCursor) -> Result<Vec<NodeId>> {
    let mut out = Vec::new();
    while cursor.next()? {
        out.extend(cursor.node_reference());
    }
    Ok(out)
}

fn drain_label(cursor: &mut NodeLabelIndexCursor) -> Result<Vec<NodeId>> {
    let mut out = Vec::new();
    while cursor.next()? {
        out.extend(cursor.node_reference());
    }
    Ok(out)
}

fn drain_edges(cursor: &mut EdgeScanCursor) -> Result<Vec<EdgeId>> {
    let mut out = Vec::new();
    while cursor.next()? {
        out.extend(cursor.edge_reference());
    }
    Ok(out)
}

#[test]
fn mixed_overlay_label_scan_yields_exactly_visible_members() -> Result<()> {
    let kernel = kernel();
    let store = kernel.store();
    let n1 = store.create_node(&[PERSON])?;
    let n2 = store.create_node(&[PERSON])?;
    let n3 = store.create_node(&[PERSON])?;

    let tx = kernel.begin(Arc::new(AllowAll));
    let n4 = tx.write().node_create(&[PERSON])?;
    assert!(tx.write().node_remove_label(n2, PERSON)?);

    let mut cursor = tx.acquire_label_index_cursor();
    tx.read().node_label_scan(&mut cursor, PERSON, IndexOrder::None);
    let seen = drain_label(&mut cursor)?;
    assert_eq!(seen.len(), 3, "no duplicates: {seen:?}");
    let seen: BTreeSet<NodeId> = seen.into_iter().collect();
    assert_eq!(seen, BTreeSet::from([n1, n3, n4]));
    drop(cursor);
    tx.close()
}

#[test]
fn open_cursor_ignores_writes_made_after_it_started() -> Result<()> {
    let kernel = kernel();
    let store = kernel.store();
    let committed: Vec<NodeId> = (0..4)
        .map(|_| store.create_node(&[PERSON]))
        .collect::<Result<_>>()?;

    let tx = kernel.begin(Arc::new(AllowAll));
    let early = tx.write().node_create(&[PERSON])?;

    let mut nodes = tx.acquire_node_cursor();
    tx.read().all_nodes_scan(&mut nodes);
    assert!(nodes.next()?);
    let mut seen = vec![nodes.node_reference().expect("positioned")];

    let late = tx.write().node_create(&[PERSON])?;
    assert!(tx.write().node_delete(committed[3])?);
    seen.extend(drain_nodes(&mut nodes)?);

    let mut expected = committed.clone();
    expected.push(early);
    seen.sort_unstable();
    expected.sort_unstable();
    assert_eq!(seen, expected, "scan keeps the view it started with");

    tx.read().all_nodes_scan(&mut nodes);
    let mut after: Vec<NodeId> = drain_nodes(&mut nodes)?;
    after.sort_unstable();
    let mut expected = vec![committed[0], committed[1], committed[2], early, late];
    expected.sort_unstable();
    assert_eq!(after, expected, "a new scan sees every write");
    drop(nodes);
    tx.close()
}

#[test]
fn removed_entities_never_surface() -> Result<()> {
    let kernel = kernel();
    let store = kernel.store();
    let a = store.create_node(&[PERSON])?;
    let b = store.create_node(&[PERSON])?;
    let c = store.create_node(&[])?;
    let ab = store.create_edge(a, KNOWS, b)?;
    let bc = store.create_edge(b, KNOWS, c)?;

    let tx = kernel.begin(Arc::new(AllowAll));
    assert!(tx.write().edge_delete(ab)?);
    assert_eq!(tx.write().node_detach_delete(c)?, Some(1));

    let mut nodes = tx.acquire_node_cursor();
    tx.read().all_nodes_scan(&mut nodes);
    assert_eq!(drain_nodes(&mut nodes)?, vec![a, b]);

    tx.read().single_node(&mut nodes, c);
    assert!(!nodes.next()?, "deleted node is invisible to single lookups");

    let mut edges = tx.acquire_edge_scan_cursor();
    tx.read().all_edges_scan(&mut edges);
    assert!(drain_edges(&mut edges)?.is_empty());
    tx.read().single_edge(&mut edges, bc);
    assert!(!edges.next()?);

    tx.read().single_node(&mut nodes, b);
    assert!(nodes.next()?);
    let mut traversal = tx.acquire_traversal_cursor();
    nodes.edges(&mut traversal, EdgeSelection::all())?;
    assert!(!traversal.next()?, "both incident edges were removed");
    drop(traversal);
    drop(edges);
    drop(nodes);
    tx.close()?;

    // Committed state is untouched by the discarded transaction.
    let tx = kernel.begin(Arc::new(AllowAll));
    let mut edges = tx.acquire_edge_scan_cursor();
    tx.read().all_edges_scan(&mut edges);
    assert_eq!(drain_edges(&mut edges)?, vec![ab, bc]);
    drop(edges);
    tx.close()
}

#[test]
fn traversal_merges_added_edges_by_direction() -> Result<()> {
    let kernel = kernel();
    let store = kernel.store();
    let hub = store.create_node(&[PERSON])?;
    let other = store.create_node(&[PERSON])?;
    let committed_out = store.create_edge(hub, KNOWS, other)?;

    let tx = kernel.begin(Arc::new(AllowAll));
    let added_in = tx.write().edge_create(other, KNOWS, hub)?;
    let added_out = tx.write().edge_create(hub, TypeId(8), other)?;

    let mut nodes = tx.acquire_node_cursor();
    tx.read().single_node(&mut nodes, hub);
    assert!(nodes.next()?);
    let mut traversal = tx.acquire_traversal_cursor();

    let mut collect = |selection: EdgeSelection| -> Result<BTreeSet<EdgeId>> {
        nodes.edges(&mut traversal, selection)?;
        let mut out = BTreeSet::new();
        while traversal.next()? {
            out.extend(traversal.edge_reference());
        }
        Ok(out)
    };
    assert_eq!(
        collect(EdgeSelection::direction(Direction::Outgoing))?,
        BTreeSet::from([committed_out, added_out])
    );
    assert_eq!(
        collect(EdgeSelection::direction(Direction::Incoming))?,
        BTreeSet::from([added_in])
    );
    assert_eq!(
        collect(EdgeSelection::all().with_types(&[KNOWS]))?,
        BTreeSet::from([committed_out, added_in])
    );
    drop(traversal);
    drop(nodes);
    tx.close()
}

#[test]
fn empty_scans_are_not_errors() -> Result<()> {
    let kernel = kernel();
    let tx = kernel.begin(Arc::new(AllowAll));
    let mut nodes = tx.acquire_node_cursor();
    tx.read().all_nodes_scan(&mut nodes);
    assert!(drain_nodes(&mut nodes)?.is_empty());
    tx.read().single_node(&mut nodes, NodeId(42));
    assert!(!nodes.next()?);
    let mut labels = tx.acquire_label_index_cursor();
    tx.read().node_label_scan(&mut labels, PERSON, IndexOrder::Ascending);
    assert!(drain_label(&mut labels)?.is_empty());
    drop(labels);
    drop(nodes);
    tx.close()
}
