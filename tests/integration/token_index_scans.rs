#![allow(missing_docs)]

use std::sync::Arc;

use sombra_cursor::storage::cursor::{Cursor, EdgeTypeIndexCursor, NodeLabelIndexCursor};
use sombra_cursor::storage::index::IndexOrder;
use sombra_cursor::storage::security::{AccessMode, AllowAll, RestrictedAccess};
use sombra_cursor::storage::{CounterMetrics, CursorMetrics};
use sombra_cursor::types::{EdgeId, LabelId, NodeId, Result, TypeId};
use sombra_cursor::{CursorOptions, Kernel};

const PERSON: LabelId = LabelId(1);
const SECRET: LabelId = LabelId(2);
const KNOWS: TypeId = TypeId(3);

fn drain_label(cursor: &mut NodeLabelIndexCursor) -> Result<Vec<NodeId>> {
    let mut out = Vec::new();
    while cursor.next()? {
        out.extend(cursor.node_reference());
    }
    Ok(out)
}

fn drain_type(cursor: &mut EdgeTypeIndexCursor) -> Result<Vec<EdgeId>> {
    let mut out = Vec::new();
    while cursor.next()? {
        out.extend(cursor.edge_reference());
    }
    Ok(out)
}

/// Ten committed nodes, the even ones labelled. Returns all ids in order.
fn interleaved(kernel: &Kernel) -> Result<Vec<NodeId>> {
    (0..10)
        .map(|i| {
            let labels: &[LabelId] = if i % 2 == 0 { &[PERSON] } else { &[] };
            kernel.store().create_node(labels)
        })
        .collect()
}

#[test]
fn ordered_label_scan_merges_overlay_in_id_order() -> Result<()> {
    let kernel = Kernel::new(CursorOptions::default());
    let ids = interleaved(&kernel)?;
    let tx = kernel.begin(Arc::new(AllowAll));
    // Odd ids gain the label in the transaction, one even id loses it.
    for node in [ids[1], ids[5], ids[9]] {
        assert!(tx.write().node_add_label(node, PERSON)?);
    }
    assert!(tx.write().node_remove_label(ids[4], PERSON)?);
    let created = tx.write().node_create(&[PERSON])?;

    let mut expected = vec![ids[0], ids[1], ids[2], ids[5], ids[6], ids[8], ids[9], created];
    expected.sort_unstable();

    let mut cursor = tx.acquire_label_index_cursor();
    tx.read().node_label_scan(&mut cursor, PERSON, IndexOrder::Ascending);
    let ascending = drain_label(&mut cursor)?;
    assert!(ascending.windows(2).all(|w| w[0] <= w[1]), "{ascending:?}");
    assert_eq!(ascending, expected);

    tx.read().node_label_scan(&mut cursor, PERSON, IndexOrder::Descending);
    let descending = drain_label(&mut cursor)?;
    assert!(descending.windows(2).all(|w| w[0] >= w[1]), "{descending:?}");
    expected.reverse();
    assert_eq!(descending, expected);
    drop(cursor);
    tx.close()
}

#[test]
fn ordered_type_scan_merges_added_and_removed_edges() -> Result<()> {
    let kernel = Kernel::new(CursorOptions::default());
    let store = kernel.store();
    let a = store.create_node(&[])?;
    let b = store.create_node(&[])?;
    let committed: Vec<EdgeId> = (0..4)
        .map(|_| store.create_edge(a, KNOWS, b))
        .collect::<Result<_>>()?;
    store.create_edge(a, TypeId(4), b)?;

    let tx = kernel.begin(Arc::new(AllowAll));
    let added = tx.write().edge_create(b, KNOWS, a)?;
    assert!(tx.write().edge_delete(committed[2])?);

    let mut cursor = tx.acquire_type_index_cursor();
    tx.read().edge_type_scan(&mut cursor, KNOWS, IndexOrder::Descending);
    let seen = drain_type(&mut cursor)?;
    assert_eq!(seen, vec![added, committed[3], committed[1], committed[0]]);

    tx.read().edge_type_scan(&mut cursor, KNOWS, IndexOrder::None);
    assert!(cursor.next()?);
    assert_eq!(cursor.edge_reference(), Some(added), "unordered scans serve added ids first");
    assert_eq!(cursor.source()?, b);
    assert_eq!(cursor.target()?, a);
    drop(cursor);
    tx.close()
}

#[test]
fn label_scan_without_permission_falls_back_to_row_grants() -> Result<()> {
    let kernel = Kernel::new(CursorOptions::default());
    let ids = interleaved(&kernel)?;

    let nothing: Arc<dyn AccessMode> = Arc::new(RestrictedAccess::new());
    let tx = kernel.begin(nothing);
    let mut cursor = tx.acquire_label_index_cursor();
    tx.read().node_label_scan(&mut cursor, PERSON, IndexOrder::None);
    assert!(!cursor.uses_token_shortcut());
    assert!(drain_label(&mut cursor)?.is_empty());
    drop(cursor);
    tx.close()?;

    let rows = RestrictedAccess::new().grant_node(ids[2]).grant_node(ids[3]);
    let tx = kernel.begin(Arc::new(rows));
    let mut cursor = tx.acquire_label_index_cursor();
    tx.read().node_label_scan(&mut cursor, PERSON, IndexOrder::Ascending);
    assert_eq!(drain_label(&mut cursor)?, vec![ids[2]]);
    drop(cursor);
    tx.close()
}

#[test]
fn token_shortcut_only_when_the_whole_label_is_readable() -> Result<()> {
    let metrics = Arc::new(CounterMetrics::default());
    let shared: Arc<dyn CursorMetrics> = metrics.clone();
    let kernel = Kernel::new(CursorOptions::default().metrics(shared));
    let ids = interleaved(&kernel)?;
    assert!(kernel.store().add_label(ids[6], SECRET)?);

    let granted = RestrictedAccess::new().grant_label(PERSON);
    let tx = kernel.begin(Arc::new(granted));
    let mut cursor = tx.acquire_label_index_cursor();
    tx.read().node_label_scan(&mut cursor, PERSON, IndexOrder::Ascending);
    assert!(cursor.uses_token_shortcut());
    assert_eq!(drain_label(&mut cursor)?.len(), 5);
    drop(cursor);
    tx.close()?;
    assert_eq!(metrics.snapshot().security_rejections, 0);

    let guarded = RestrictedAccess::new().grant_label(PERSON).deny_label(SECRET);
    let tx = kernel.begin(Arc::new(guarded));
    let mut cursor = tx.acquire_label_index_cursor();
    tx.read().node_label_scan(&mut cursor, PERSON, IndexOrder::Ascending);
    assert!(!cursor.uses_token_shortcut());
    assert_eq!(drain_label(&mut cursor)?, vec![ids[0], ids[2], ids[4], ids[8]]);
    drop(cursor);
    tx.close()?;
    assert_eq!(metrics.snapshot().security_rejections, 1);
    Ok(())
}

#[test]
fn edge_type_scan_respects_type_grants() -> Result<()> {
    let kernel = Kernel::new(CursorOptions::default());
    let store = kernel.store();
    let a = store.create_node(&[])?;
    let b = store.create_node(&[])?;
    let first = store.create_edge(a, KNOWS, b)?;
    let second = store.create_edge(b, KNOWS, a)?;

    let tx = kernel.begin(Arc::new(RestrictedAccess::new().grant_edge(second)));
    let mut cursor = tx.acquire_type_index_cursor();
    tx.read().edge_type_scan(&mut cursor, KNOWS, IndexOrder::Ascending);
    assert_eq!(drain_type(&mut cursor)?, vec![second]);
    drop(cursor);
    tx.close()?;

    let tx = kernel.begin(Arc::new(RestrictedAccess::new().grant_type(KNOWS)));
    let mut cursor = tx.acquire_type_index_cursor();
    tx.read().edge_type_scan(&mut cursor, KNOWS, IndexOrder::Ascending);
    assert!(cursor.uses_token_shortcut());
    assert_eq!(drain_type(&mut cursor)?, vec![first, second]);
    drop(cursor);
    tx.close()
}

#[test]
fn open_label_scan_keeps_members_deleted_after_it_started() -> Result<()> {
    let kernel = Kernel::new(CursorOptions::default());
    let a = kernel.store().create_node(&[PERSON])?;
    let b = kernel.store().create_node(&[PERSON])?;

    let rows: Arc<dyn AccessMode> = Arc::new(RestrictedAccess::new().grant_node(a).grant_node(b));
    let whole: Arc<dyn AccessMode> = Arc::new(RestrictedAccess::new().grant_label(PERSON));
    for access in [rows, whole] {
        let tx = kernel.begin(access);
        let mut cursor = tx.acquire_label_index_cursor();
        tx.read().node_label_scan(&mut cursor, PERSON, IndexOrder::Ascending);
        assert!(cursor.next()?);
        assert_eq!(cursor.node_reference(), Some(a));
        assert!(tx.write().node_delete(b)?);

        let mut seen = vec![a];
        seen.extend(drain_label(&mut cursor)?);
        assert_eq!(seen, vec![a, b]);

        tx.read().node_label_scan(&mut cursor, PERSON, IndexOrder::Ascending);
        assert_eq!(drain_label(&mut cursor)?, vec![a], "a new scan sees the delete");
        drop(cursor);
        tx.close()?;
    }
    Ok(())
}

#[test]
fn open_type_scan_keeps_edges_deleted_after_it_started() -> Result<()> {
    let kernel = Kernel::new(CursorOptions::default());
    let store = kernel.store();
    let a = store.create_node(&[])?;
    let b = store.create_node(&[])?;
    let first = store.create_edge(a, KNOWS, b)?;
    let second = store.create_edge(b, KNOWS, a)?;

    let rows = RestrictedAccess::new().grant_edge(first).grant_edge(second);
    let tx = kernel.begin(Arc::new(rows));
    let mut cursor = tx.acquire_type_index_cursor();
    tx.read().edge_type_scan(&mut cursor, KNOWS, IndexOrder::None);
    assert!(!cursor.uses_token_shortcut());
    assert!(cursor.next()?);
    assert_eq!(cursor.edge_reference(), Some(first));
    assert!(tx.write().edge_delete(second)?);

    assert!(cursor.next()?);
    assert_eq!(cursor.edge_reference(), Some(second));
    assert_eq!(cursor.source()?, b);
    assert!(!cursor.next()?);
    drop(cursor);
    tx.close()
}
