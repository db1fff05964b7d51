#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use sombra_cursor::kernel::{verify_detach, DetachSnapshot, DetachVerdict};
use sombra_cursor::primitives::concurrency::ResourceType;
use sombra_cursor::storage::index::{IndexCapability, IndexDescriptor, PropertyPredicate};
use sombra_cursor::storage::security::AllowAll;
use sombra_cursor::storage::{CounterMetrics, CursorMetrics};
use sombra_cursor::types::{
    EdgeId, EntityKind, IndexId, LabelId, NodeId, PropId, PropValue, Result, TypeId,
};
use sombra_cursor::{CursorOptions, Kernel};

const USER: LabelId = LabelId(1);
const EMAIL: PropId = PropId(4);
const BY_EMAIL: IndexId = IndexId(2);

fn kernel_with_unique_email() -> Kernel {
    let kernel = Kernel::new(CursorOptions::default());
    kernel
        .store()
        .create_index(IndexDescriptor {
            id: BY_EMAIL,
            name: "user_email".into(),
            entity: EntityKind::Node,
            tokens: vec![USER.0],
            props: vec![EMAIL],
            unique: true,
            capability: IndexCapability::default(),
        })
        .expect("index");
    kernel
}

#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Created(NodeId),
    Found(NodeId),
}

#[test]
fn concurrent_unique_lookups_agree_on_a_single_entry() -> Result<()> {
    for _ in 0..20 {
        let kernel = kernel_with_unique_email();
        let start = Barrier::new(2);
        let outcomes: Vec<Outcome> = thread::scope(|s| {
            let workers: Vec<_> = (0..2)
                .map(|_| {
                    s.spawn(|| -> Result<Outcome> {
                        let tx = kernel.begin(Arc::new(AllowAll));
                        let mut cursor = tx.acquire_node_value_index_cursor();
                        let query = [PropertyPredicate::exact(EMAIL, "ada@example.org")];
                        start.wait();
                        let found =
                            tx.read()
                                .locking_node_unique_index_seek(&mut cursor, BY_EMAIL, &query)?;
                        drop(cursor);
                        let outcome = match found {
                            Some(node) => Outcome::Found(node),
                            None => {
                                // Exclusive entry lock held: commit the entry, then release.
                                let store = kernel.store();
                                let node = store.create_node(&[USER])?;
                                store.set_node_property(
                                    node,
                                    EMAIL,
                                    PropValue::Str("ada@example.org".into()),
                                )?;
                                Outcome::Created(node)
                            }
                        };
                        tx.close()?;
                        Ok(outcome)
                    })
                })
                .collect();
            workers
                .into_iter()
                .map(|w| w.join().expect("worker panicked"))
                .collect::<Result<Vec<_>>>()
        })?;

        let created: Vec<NodeId> = outcomes
            .iter()
            .filter_map(|o| match o {
                Outcome::Created(node) => Some(*node),
                Outcome::Found(_) => None,
            })
            .collect();
        assert_eq!(created.len(), 1, "exactly one creator: {outcomes:?}");
        assert!(outcomes.contains(&Outcome::Found(created[0])));
        assert_eq!(kernel.store().index(BY_EMAIL)?.count(), 1);
        assert_eq!(kernel.locks().snapshot().locked_resources, 0);
    }
    Ok(())
}

#[test]
fn endpoint_locks_wait_for_a_detaching_transaction() -> Result<()> {
    let kernel = Kernel::new(CursorOptions::default());
    let store = kernel.store();
    let hub = store.create_node(&[])?;
    let spoke = store.create_node(&[])?;
    let edge = store.create_edge(spoke, TypeId(1), hub)?;

    let detacher = kernel.begin(Arc::new(AllowAll));
    assert_eq!(detacher.write().node_detach_delete(hub)?, Some(1));
    let released = AtomicBool::new(false);

    thread::scope(|s| -> Result<()> {
        let waiter = s.spawn(|| -> Result<bool> {
            let tx = kernel.begin(Arc::new(AllowAll));
            let locked = tx.write().lock_edge_endpoints_for_delete(edge)?;
            assert!(
                released.load(Ordering::SeqCst),
                "endpoint locks granted while the detach still held them"
            );
            tx.close()?;
            Ok(locked)
        });
        thread::sleep(Duration::from_millis(50));
        released.store(true, Ordering::SeqCst);
        // Closing discards the detach, so the edge is still there for the waiter.
        detacher.close()?;
        assert!(waiter.join().expect("waiter panicked")?);
        Ok(())
    })?;
    assert_eq!(kernel.locks().snapshot().locked_resources, 0);
    Ok(())
}

#[test]
fn overlapping_detaches_never_deadlock() -> Result<()> {
    let kernel = Kernel::new(CursorOptions::default());
    let store = kernel.store();
    let ring: Vec<NodeId> = (0..6)
        .map(|_| store.create_node(&[]))
        .collect::<Result<_>>()?;
    for i in 0..ring.len() {
        store.create_edge(ring[i], TypeId(0), ring[(i + 1) % ring.len()])?;
    }

    thread::scope(|s| {
        let workers: Vec<_> = ring
            .iter()
            .map(|node| {
                let kernel = &kernel;
                let node = *node;
                s.spawn(move || -> Result<()> {
                    for _ in 0..25 {
                        let tx = kernel.begin(Arc::new(AllowAll));
                        assert_eq!(tx.write().node_detach_delete(node)?, Some(2));
                        tx.close()?;
                    }
                    Ok(())
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|w| w.join().expect("worker panicked"))
            .collect::<Result<Vec<()>>>()
    })?;
    assert_eq!(kernel.locks().snapshot().locked_resources, 0);
    Ok(())
}

#[test]
fn detach_retries_when_the_neighbourhood_moves() {
    let snapshot = DetachSnapshot {
        exists: true,
        labels: vec![USER],
        edges: vec![(EdgeId(4), TypeId(0))],
        nodes: vec![NodeId(1), NodeId(2)],
    };
    let mut reread = snapshot.clone();
    assert_eq!(verify_detach(&snapshot, &reread), DetachVerdict::Proceed);
    reread.edges.push((EdgeId(9), TypeId(0)));
    reread.nodes.push(NodeId(3));
    assert_eq!(verify_detach(&snapshot, &reread), DetachVerdict::Retry);
    reread = DetachSnapshot::default();
    assert_eq!(verify_detach(&snapshot, &reread), DetachVerdict::Retry);
}

#[test]
fn detach_delete_reports_edge_count_and_records_no_retry_when_stable() -> Result<()> {
    let metrics = Arc::new(CounterMetrics::default());
    let shared: Arc<dyn CursorMetrics> = metrics.clone();
    let kernel = Kernel::new(CursorOptions::default().metrics(shared).dense_node_threshold(4));
    let store = kernel.store();
    let hub = store.create_node(&[USER])?;
    for ty in 0..6 {
        let leaf = store.create_node(&[])?;
        store.create_edge(hub, TypeId(ty % 2), leaf)?;
    }

    let tx = kernel.begin(Arc::new(AllowAll));
    let extra = tx.write().node_create(&[])?;
    tx.write().edge_create(extra, TypeId(5), hub)?;
    assert_eq!(tx.write().node_detach_delete(hub)?, Some(7));
    assert!(tx.locks().holds_exclusive(ResourceType::Node, hub.0));
    assert_eq!(metrics.snapshot().lock_retries, 0);
    tx.close()
}
