#![allow(missing_docs)]

use std::sync::Arc;

use sombra_cursor::storage::cursor::{
    Cursor, NodeCursor, NodeLabelIndexCursor, PropertyCursor,
};
use sombra_cursor::storage::index::IndexOrder;
use sombra_cursor::storage::security::AllowAll;
use sombra_cursor::storage::{CounterMetrics, CursorMetrics};
use sombra_cursor::types::{LabelId, PropId, PropValue, Result, SombraError};
use sombra_cursor::{CursorOptions, Kernel};

const PERSON: LabelId = LabelId(1);

fn counted(options: CursorOptions) -> (Kernel, Arc<CounterMetrics>) {
    let metrics = Arc::new(CounterMetrics::default());
    let shared: Arc<dyn CursorMetrics> = metrics.clone();
    (Kernel::new(options.metrics(shared)), metrics)
}

#[test]
fn closing_twice_returns_the_cursor_once() -> Result<()> {
    let (kernel, metrics) = counted(CursorOptions::default().track_cursor_close(true));
    kernel.store().create_node(&[PERSON])?;
    let tx = kernel.begin(Arc::new(AllowAll));

    let mut cursor = tx.acquire_node_cursor();
    tx.read().all_nodes_scan(&mut cursor);
    assert!(cursor.next()?);
    cursor.close();
    cursor.close();
    assert!(cursor.is_closed());
    assert!(matches!(cursor.next(), Err(SombraError::Usage(_))));
    cursor.release();

    assert_eq!(kernel.pool().idle::<NodeCursor>(), 1);
    assert_eq!(metrics.snapshot().cursors_released, 1);
    tx.close()
}

#[test]
fn released_cursors_are_reused_across_transactions() -> Result<()> {
    let (kernel, metrics) = counted(CursorOptions::default());
    for _ in 0..3 {
        kernel.store().create_node(&[PERSON])?;
    }

    for round in 0..4 {
        let tx = kernel.begin(Arc::new(AllowAll));
        let mut cursor = tx.acquire_label_index_cursor();
        tx.read().node_label_scan(&mut cursor, PERSON, IndexOrder::Ascending);
        let mut seen = 0;
        while cursor.next()? {
            seen += 1;
        }
        assert_eq!(seen, 3, "round {round} sees a clean cursor");
        drop(cursor);
        tx.close()?;
    }

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.cursors_acquired, 4);
    assert_eq!(snapshot.cursors_reused, 3);
    assert_eq!(snapshot.cursors_released, 4);
    assert_eq!(kernel.pool().idle::<NodeLabelIndexCursor>(), 1);
    Ok(())
}

#[test]
fn recycled_cursors_refuse_to_advance_before_initialisation() -> Result<()> {
    let (kernel, _) = counted(CursorOptions::default());
    let tx = kernel.begin(Arc::new(AllowAll));

    let fresh = tx.acquire_node_cursor();
    assert!(!fresh.is_closed());
    fresh.release();

    let mut recycled = tx.acquire_node_cursor();
    assert!(recycled.is_closed());
    assert!(matches!(recycled.next(), Err(SombraError::Usage(_))));
    tx.read().all_nodes_scan(&mut recycled);
    assert!(!recycled.next()?);
    drop(recycled);
    tx.close()
}

#[test]
fn pool_capacity_bounds_idle_cursors() -> Result<()> {
    let (kernel, _) = counted(CursorOptions::default().pool_capacity(2));
    let tx = kernel.begin(Arc::new(AllowAll));
    let held: Vec<_> = (0..5).map(|_| tx.acquire_property_cursor()).collect();
    drop(held);
    assert_eq!(kernel.pool().idle::<PropertyCursor>(), 2);
    kernel.pool().clear();
    assert_eq!(kernel.pool().idle::<PropertyCursor>(), 0);
    tx.close()
}

#[test]
fn transaction_close_reports_cursors_left_open() -> Result<()> {
    let options = CursorOptions::default()
        .track_cursor_close(true)
        .trace_cursor_close_stacks(true);
    let (kernel, _) = counted(options);
    let node = kernel.store().create_node(&[PERSON])?;
    kernel
        .store()
        .set_node_property(node, PropId(1), PropValue::Int(7))?;

    let tx = kernel.begin(Arc::new(AllowAll));
    let mut nodes = NodeCursor::new();
    tx.read().single_node(&mut nodes, node);
    assert!(nodes.next()?);
    let mut props = PropertyCursor::new();
    nodes.properties(&mut props)?;
    assert!(props.next()?);
    nodes.close();
    // The property cursor is still open.
    assert!(matches!(tx.close(), Err(SombraError::Usage(_))));
    props.close();
    assert_eq!(kernel.locks().snapshot().locked_resources, 0);

    let tx = kernel.begin(Arc::new(AllowAll));
    let mut pooled = tx.acquire_property_cursor();
    let mut nodes = tx.acquire_node_cursor();
    tx.read().single_node(&mut nodes, node);
    assert!(nodes.next()?);
    nodes.properties(&mut pooled)?;
    assert_eq!(pooled.find(PropId(1))?, Some(PropValue::Int(7)));
    drop(pooled);
    drop(nodes);
    tx.close()
}

#[test]
fn untracked_transactions_close_cleanly_with_open_cursors() -> Result<()> {
    let (kernel, _) = counted(CursorOptions::default().track_cursor_close(false));
    let tx = kernel.begin(Arc::new(AllowAll));
    let mut nodes = NodeCursor::new();
    tx.read().all_nodes_scan(&mut nodes);
    tx.close()?;
    nodes.close();
    Ok(())
}
