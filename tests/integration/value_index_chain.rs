#![allow(missing_docs)]

use std::ops::Bound;
use std::sync::Arc;

use sombra_cursor::storage::cursor::{Cursor, NodeValueIndexCursor};
use sombra_cursor::storage::index::{
    IndexCapability, IndexDescriptor, IndexOrder, IndexQueryConstraints, PropertyPredicate,
};
use sombra_cursor::storage::security::{AllowAll, RestrictedAccess};
use sombra_cursor::storage::{CounterMetrics, CursorMetrics};
use sombra_cursor::types::{
    EntityKind, IndexId, IndexValue, LabelId, NodeId, PropId, PropValue, Result, SombraError,
};
use sombra_cursor::{CursorOptions, Kernel};

const PERSON: LabelId = LabelId(1);
const AGE: PropId = PropId(1);
const NAME: PropId = PropId(2);
const PEOPLE: IndexId = IndexId(10);

fn kernel_with_index(capability: IndexCapability) -> (Kernel, Arc<CounterMetrics>) {
    let metrics = Arc::new(CounterMetrics::default());
    let shared: Arc<dyn CursorMetrics> = metrics.clone();
    let kernel = Kernel::new(CursorOptions::default().metrics(shared));
    kernel
        .store()
        .create_index(IndexDescriptor {
            id: PEOPLE,
            name: "person_age_name".into(),
            entity: EntityKind::Node,
            tokens: vec![PERSON.0],
            props: vec![AGE, NAME],
            unique: false,
            capability,
        })
        .expect("index");
    (kernel, metrics)
}

fn person(kernel: &Kernel, age: i64, name: &str) -> Result<NodeId> {
    let store = kernel.store();
    let node = store.create_node(&[PERSON])?;
    store.set_node_property(node, AGE, PropValue::Int(age))?;
    store.set_node_property(node, NAME, PropValue::Str(name.into()))?;
    Ok(node)
}

fn drain(cursor: &mut NodeValueIndexCursor) -> Result<Vec<NodeId>> {
    let mut out = Vec::new();
    while cursor.next()? {
        out.extend(cursor.node_reference());
    }
    Ok(out)
}

fn ages(lower: i64, upper: i64) -> PropertyPredicate {
    PropertyPredicate::range(
        AGE,
        Bound::Included(PropValue::Int(lower)),
        Bound::Excluded(PropValue::Int(upper)),
    )
}

#[test]
fn injector_reads_the_store_once_per_unknown_hit() -> Result<()> {
    let (kernel, metrics) = kernel_with_index(IndexCapability::lossy(6));
    let short = person(&kernel, 30, "ada")?;
    let long = person(&kernel, 31, "grace brewster hopper")?;
    person(&kernel, 50, "alan")?;

    let tx = kernel.begin(Arc::new(AllowAll));
    let mut cursor = tx.acquire_node_value_index_cursor();
    tx.read().node_index_seek(
        &mut cursor,
        PEOPLE,
        &[ages(20, 40)],
        IndexQueryConstraints::ordered(IndexOrder::Ascending),
    )?;

    assert!(cursor.next()?);
    assert_eq!(cursor.node_reference(), Some(short));
    assert_eq!(
        cursor.values(),
        &[
            IndexValue::Known(PropValue::Int(30)),
            IndexValue::Known(PropValue::Str("ada".into()))
        ]
    );
    assert_eq!(metrics.snapshot().store_lookups, 0, "nothing unknown yet");

    assert!(cursor.next()?);
    assert_eq!(cursor.node_reference(), Some(long));
    assert_eq!(cursor.property_value(0), Some(&PropValue::Int(31)));
    assert_eq!(
        cursor.property_value(1),
        Some(&PropValue::Str("grace brewster hopper".into()))
    );
    assert_eq!(metrics.snapshot().store_lookups, 1);

    assert!(!cursor.next()?);
    assert_eq!(metrics.snapshot().store_lookups, 1);
    drop(cursor);
    tx.close()
}

#[test]
fn approximate_composite_hits_are_reverified() -> Result<()> {
    let (kernel, _) = kernel_with_index(IndexCapability::lossy(64));
    let ada = person(&kernel, 30, "ada")?;
    person(&kernel, 30, "alan")?;

    let tx = kernel.begin(Arc::new(AllowAll));
    let mut cursor = tx.acquire_node_value_index_cursor();
    tx.read().node_index_seek(
        &mut cursor,
        PEOPLE,
        &[
            PropertyPredicate::exact(AGE, 30i64),
            PropertyPredicate::exact(NAME, "ada"),
        ],
        IndexQueryConstraints::unconstrained(),
    )?;
    assert_eq!(drain(&mut cursor)?, vec![ada]);
    drop(cursor);
    tx.close()
}

#[test]
fn transaction_writes_move_entities_in_and_out_of_results() -> Result<()> {
    let (kernel, _) = kernel_with_index(IndexCapability::default());
    let young = person(&kernel, 25, "ada")?;
    let old = person(&kernel, 70, "alan")?;
    let leaving = person(&kernel, 26, "edsger")?;

    let tx = kernel.begin(Arc::new(AllowAll));
    let write = tx.write();
    write.node_set_property(old, AGE, PropValue::Int(27))?;
    write.node_set_property(leaving, AGE, PropValue::Int(90))?;
    let fresh = write.node_create(&[PERSON])?;
    write.node_set_property(fresh, AGE, PropValue::Int(21))?;
    write.node_set_property(fresh, NAME, PropValue::Str("barbara".into()))?;
    let nameless = write.node_create(&[PERSON])?;
    write.node_set_property(nameless, AGE, PropValue::Int(22))?;

    let mut cursor = tx.acquire_node_value_index_cursor();
    tx.read().node_index_seek(
        &mut cursor,
        PEOPLE,
        &[ages(20, 30)],
        IndexQueryConstraints::ordered(IndexOrder::Ascending),
    )?;
    assert_eq!(drain(&mut cursor)?, vec![fresh, young, old]);

    tx.read().node_index_seek(
        &mut cursor,
        PEOPLE,
        &[ages(20, 30)],
        IndexQueryConstraints::ordered(IndexOrder::Descending),
    )?;
    assert_eq!(drain(&mut cursor)?, vec![old, young, fresh]);
    drop(cursor);
    tx.close()
}

#[test]
fn schema_mismatches_fail_before_iteration() -> Result<()> {
    let (kernel, _) = kernel_with_index(IndexCapability {
        orderable: false,
        ..IndexCapability::default()
    });
    person(&kernel, 30, "ada")?;
    let tx = kernel.begin(Arc::new(AllowAll));
    let mut cursor = tx.acquire_node_value_index_cursor();

    let wrong_slot = tx.read().node_index_seek(
        &mut cursor,
        PEOPLE,
        &[PropertyPredicate::exact(NAME, "ada")],
        IndexQueryConstraints::unconstrained(),
    );
    assert!(matches!(wrong_slot, Err(SombraError::IndexNotApplicable(_))));

    let ordered = tx.read().node_index_seek(
        &mut cursor,
        PEOPLE,
        &[ages(0, 100)],
        IndexQueryConstraints::ordered(IndexOrder::Ascending),
    );
    assert!(matches!(ordered, Err(SombraError::IndexNotApplicable(_))));

    let mut edges = tx.acquire_edge_value_index_cursor();
    let wrong_kind = tx.read().edge_index_seek(
        &mut edges,
        PEOPLE,
        &[ages(0, 100)],
        IndexQueryConstraints::unconstrained(),
    );
    assert!(matches!(wrong_kind, Err(SombraError::IndexNotApplicable(_))));

    let missing = tx.read().node_index_seek(
        &mut cursor,
        IndexId(99),
        &[ages(0, 100)],
        IndexQueryConstraints::unconstrained(),
    );
    assert!(matches!(missing, Err(SombraError::NotFound)));
    drop(edges);
    drop(cursor);
    tx.close()
}

#[test]
fn unreadable_properties_hide_hits() -> Result<()> {
    let (kernel, metrics) = kernel_with_index(IndexCapability::default());
    person(&kernel, 30, "ada")?;
    let access = RestrictedAccess::new().grant_label(PERSON).deny_property(NAME);
    let tx = kernel.begin(Arc::new(access));
    let mut cursor = tx.acquire_node_value_index_cursor();
    tx.read().node_index_seek(
        &mut cursor,
        PEOPLE,
        &[
            PropertyPredicate::exact(AGE, 30i64),
            PropertyPredicate::exact(NAME, "ada"),
        ],
        IndexQueryConstraints::unconstrained(),
    )?;
    assert!(drain(&mut cursor)?.is_empty());
    assert_eq!(metrics.snapshot().security_rejections, 1);

    tx.read()
        .node_index_seek(&mut cursor, PEOPLE, &[ages(0, 100)], IndexQueryConstraints::unconstrained())?;
    assert_eq!(drain(&mut cursor)?.len(), 1, "name is not part of this query");
    drop(cursor);
    tx.close()
}

#[test]
fn open_seek_under_row_grants_keeps_hits_deleted_after_it_started() -> Result<()> {
    let (kernel, _) = kernel_with_index(IndexCapability::default());
    let a = person(&kernel, 30, "ada")?;
    let b = person(&kernel, 35, "bob")?;

    let tx = kernel.begin(Arc::new(RestrictedAccess::new().grant_node(a).grant_node(b)));
    let mut cursor = tx.acquire_node_value_index_cursor();
    tx.read().node_index_seek(
        &mut cursor,
        PEOPLE,
        &[ages(0, 100)],
        IndexQueryConstraints::ordered(IndexOrder::Ascending),
    )?;
    assert!(cursor.next()?);
    assert_eq!(cursor.node_reference(), Some(a));
    assert!(tx.write().node_delete(b)?);

    assert!(cursor.next()?);
    assert_eq!(cursor.node_reference(), Some(b));
    assert!(cursor.entity()?.has_label(PERSON));
    assert!(!cursor.next()?);

    tx.read().node_index_seek(
        &mut cursor,
        PEOPLE,
        &[ages(0, 100)],
        IndexQueryConstraints::ordered(IndexOrder::Ascending),
    )?;
    assert_eq!(drain(&mut cursor)?, vec![a], "a new seek sees the delete");
    drop(cursor);
    tx.close()
}

#[test]
fn ordered_seek_without_values_interleaves_transaction_hits() -> Result<()> {
    let (kernel, _) = kernel_with_index(IndexCapability::default());
    let young = person(&kernel, 20, "yan")?;
    let old = person(&kernel, 60, "olu")?;

    let tx = kernel.begin(Arc::new(AllowAll));
    let mid = tx.write().node_create(&[PERSON])?;
    tx.write().node_set_property(mid, AGE, PropValue::Int(40))?;
    tx.write().node_set_property(mid, NAME, PropValue::Str("mia".into()))?;

    let mut cursor = tx.acquire_node_value_index_cursor();
    tx.read().node_index_seek(
        &mut cursor,
        PEOPLE,
        &[ages(0, 100)],
        IndexQueryConstraints::ordered(IndexOrder::Ascending).with_values(false),
    )?;
    assert_eq!(drain(&mut cursor)?, vec![young, mid, old]);
    drop(cursor);
    tx.close()
}
