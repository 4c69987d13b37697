//! End-to-end scenarios over the public store API.
//!
//! Each test builds a small IR tree with the `Database` API and checks one
//! observable behavior: reconciliation, ancestry, dynamic properties,
//! self-healing back-references, opt-in kind indexing, and cross-database
//! reads through external modules.

use std::sync::Arc;

use irgraph_core::{
    ChildSlotSpec, Database, DatabaseConfig, DatabaseId, DynamicPropertyKey, ElementClassSpec, ElementId,
    KindId, Parent, PhaseLifetime, ReferenceKey, Schema, SlotId, StoreError,
};

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

struct Ir {
    schema: Arc<Schema>,
    file: KindId,
    function: KindId,
    block: KindId,
    get_value: KindId,
    declarations: SlotId,
    body: SlotId,
    statements: SlotId,
    symbol: ReferenceKey,
}

fn ir() -> Ir {
    let schema = Arc::new(
        Schema::from_specs([
            ElementClassSpec::new("file").with_slot(ChildSlotSpec::list("declarations")),
            ElementClassSpec::new("function")
                .with_slot(ChildSlotSpec::list("parameters"))
                .with_slot(ChildSlotSpec::single("body")),
            ElementClassSpec::new("block").with_slot(ChildSlotSpec::list("statements")),
            ElementClassSpec::new("get_value").with_reference("symbol"),
        ])
        .unwrap(),
    );
    Ir {
        file: schema.kind_by_name("file").unwrap(),
        function: schema.kind_by_name("function").unwrap(),
        block: schema.kind_by_name("block").unwrap(),
        get_value: schema.kind_by_name("get_value").unwrap(),
        declarations: schema.slot("file", "declarations").unwrap(),
        body: schema.slot("function", "body").unwrap(),
        statements: schema.slot("block", "statements").unwrap(),
        symbol: schema.reference_key("get_value", "symbol").unwrap(),
        schema,
    }
}

fn database(ir: &Ir) -> Database {
    Database::with_config(
        ir.schema.clone(),
        DatabaseConfig {
            verify_on_realize: true,
            ..DatabaseConfig::named("scenario")
        },
    )
}

/// file > function > body block, attached to the database root.
fn function_in_file(ir: &Ir, db: &mut Database) -> (ElementId, ElementId, ElementId) {
    let file = db.create_element(ir.file).unwrap();
    let function = db.create_element(ir.function).unwrap();
    let block = db.create_element(ir.block).unwrap();
    db.move_to_root(file).unwrap();
    db.move_to(function, file, ir.declarations).unwrap();
    db.move_to(block, function, ir.body).unwrap();
    (file, function, block)
}

// ---------------------------------------------------------------------------
// Tree movements
// ---------------------------------------------------------------------------

#[test]
fn moved_element_is_in_its_new_slot_after_realize() {
    let ir = ir();
    let mut db = database(&ir);
    let (file, function, block) = function_in_file(&ir, &mut db);
    let other = db.create_element(ir.function).unwrap();
    db.move_to(other, file, ir.declarations).unwrap();

    db.move_to(block, other, ir.body).unwrap();
    db.realize_tree_movements().unwrap();

    assert_eq!(db.children(other, ir.body).unwrap(), &[block]);
    assert!(db.children(function, ir.body).unwrap().is_empty());
    assert_eq!(db.parent(block).unwrap(), Some(Parent::Element(other)));
    assert_eq!(db.containing_list(block).unwrap(), Some(&[block][..]));
}

type Observation = (Vec<ElementId>, bool, Option<DatabaseId>, String);

fn observe(ir: &Ir, db: &mut Database, file: ElementId, block: ElementId) -> Observation {
    let indexed = db.get_elements_with_index(ir.function).unwrap().collect();
    let ancestor = db.is_ancestor_of(file, block).unwrap();
    let containing = db.containing_database(block).unwrap();
    let outline = db.render_tree().unwrap();
    (indexed, ancestor, containing, outline)
}

#[test]
fn realize_is_idempotent() {
    let ir = ir();
    let mut db = database(&ir);
    let (file, function, block) = function_in_file(&ir, &mut db);
    db.set_indexing(function, true).unwrap();

    db.realize_tree_movements().unwrap();
    let first = observe(&ir, &mut db, file, block);
    db.realize_tree_movements().unwrap();
    let second = observe(&ir, &mut db, file, block);

    assert_eq!(first, second);
    assert_eq!(first.0, vec![function]);
    assert_eq!(db.pending_movements(), 0);
}

#[test]
fn ancestor_query_reconciles_first() {
    let ir = ir();
    let mut db = database(&ir);
    let (file, function, block) = function_in_file(&ir, &mut db);
    assert!(db.is_ancestor_of(file, block).unwrap());
    assert!(db.is_ancestor_of(function, block).unwrap());
    assert!(!db.is_ancestor_of(block, file).unwrap());
    assert!(!db.is_ancestor_of(block, block).unwrap());

    // The move is pending until the query realizes it.
    db.detach(function).unwrap();
    assert_eq!(db.pending_movements(), 1);
    assert!(!db.is_ancestor_of(file, block).unwrap());
    assert_eq!(db.pending_movements(), 0);
}

#[test]
fn ancestor_query_across_databases_is_false() {
    let ir = ir();
    let mut a = database(&ir);
    let mut b = database(&ir);
    let (file_a, _, _) = function_in_file(&ir, &mut a);
    let (_, _, block_b) = function_in_file(&ir, &mut b);

    assert!(!a.is_ancestor_of(file_a, block_b).unwrap());
    assert!(!b.is_ancestor_of(file_a, block_b).unwrap());
}

#[test]
fn moving_into_an_undefined_slot_fails() {
    let ir = ir();
    let mut db = database(&ir);
    let (_, _, block) = function_in_file(&ir, &mut db);
    let stray = db.create_element(ir.get_value).unwrap();

    let result = db.move_to(stray, block, SlotId::new(5).unwrap());
    assert!(matches!(result, Err(StoreError::IllegalMove { .. })));
    let result = db.move_to(block, stray, ir.statements);
    assert!(matches!(result, Err(StoreError::IllegalMove { .. })));
}

// ---------------------------------------------------------------------------
// Dynamic properties
// ---------------------------------------------------------------------------

#[test]
fn property_round_trip_and_slot_reuse() {
    let ir = ir();
    let mut db = database(&ir);
    let element = db.create_element(ir.block).unwrap();
    let visited = DynamicPropertyKey::<u32>::new("visited");
    let label = DynamicPropertyKey::<String>::new("label");

    db.set_property(element, &visited, Some(41)).unwrap();
    assert_eq!(db.get_property(element, &visited).unwrap(), Some(&41));

    db.set_property(element, &visited, None).unwrap();
    assert_eq!(db.get_property(element, &visited).unwrap(), None);
    assert_eq!(db.property_count(element).unwrap(), 0);

    db.set_property(element, &label, Some("entry".to_string())).unwrap();
    assert_eq!(db.property_count(element).unwrap(), 1);
    assert_eq!(db.get_property(element, &visited).unwrap(), None);
    assert_eq!(
        db.get_property(element, &label).unwrap().map(String::as_str),
        Some("entry")
    );
}

#[test]
fn get_or_compute_runs_supplier_once() {
    let ir = ir();
    let mut db = database(&ir);
    let element = db.create_element(ir.block).unwrap();
    let size = DynamicPropertyKey::<usize>::new("size");
    let mut calls = 0;

    for _ in 0..3 {
        let value = *db
            .get_or_compute_property(element, &size, || {
                calls += 1;
                12
            })
            .unwrap();
        assert_eq!(value, 12);
    }
    assert_eq!(calls, 1);
}

#[test]
fn fresh_token_does_not_observe_an_ended_phase() {
    let ir = ir();
    let mut db = database(&ir);
    let element = db.create_element(ir.block).unwrap();
    let key = DynamicPropertyKey::<u32>::new("inline-cost");

    let p1 = PhaseLifetime::begin("P1");
    let token = p1.token(&key);
    db.set_property(element, &token, Some(7)).unwrap();
    assert_eq!(db.get_property(element, &token).unwrap(), Some(&7));
    p1.end();

    assert!(matches!(
        db.get_property(element, &token),
        Err(StoreError::InvalidToken { .. })
    ));

    let p2 = PhaseLifetime::begin("P2");
    let fresh = p2.token(&key);
    assert_eq!(db.get_property(element, &fresh).unwrap(), None);
    // The read compacted the stale entry away.
    assert_eq!(db.property_count(element).unwrap(), 0);
}

// ---------------------------------------------------------------------------
// Back-references
// ---------------------------------------------------------------------------

#[test]
fn back_references_heal_without_unregistering() {
    let ir = ir();
    let mut db = database(&ir);
    let (file, function, block) = function_in_file(&ir, &mut db);
    let other = db.create_element(ir.function).unwrap();
    db.move_to(other, file, ir.declarations).unwrap();

    let read = db.create_element(ir.get_value).unwrap();
    db.move_to(read, block, ir.statements).unwrap();
    db.set_reference(read, ir.symbol, Some(function)).unwrap();
    assert_eq!(db.get_back_references(function, &ir.symbol).unwrap(), vec![read]);

    db.set_reference(read, ir.symbol, Some(other)).unwrap();
    assert!(db.get_back_references(function, &ir.symbol).unwrap().is_empty());
    assert_eq!(db.get_back_references(other, &ir.symbol).unwrap(), vec![read]);

    db.set_reference(read, ir.symbol, None).unwrap();
    assert!(db.get_back_references(other, &ir.symbol).unwrap().is_empty());
}

#[test]
fn growable_back_reference_array() {
    let ir = ir();
    let mut db = database(&ir);
    let (_, function, block) = function_in_file(&ir, &mut db);
    let always = move |_: &Database, _: ElementId| Some(function);

    let mut referrers = Vec::new();
    for registered in 1..=5 {
        let referrer = db.create_element(ir.get_value).unwrap();
        db.move_to(referrer, block, ir.statements).unwrap();
        db.register_back_reference(function, referrer).unwrap();
        referrers.push(referrer);
        assert_eq!(db.get_back_references(function, &always).unwrap().len(), registered);
    }

    assert!(db.remove_back_reference(function, referrers[2]).unwrap());
    let mut remaining = db.get_back_references(function, &always).unwrap();
    remaining.sort();
    let mut expected: Vec<_> = referrers
        .iter()
        .copied()
        .filter(|r| *r != referrers[2])
        .collect();
    expected.sort();
    assert_eq!(remaining, expected);
}

#[test]
fn duplicate_registration_is_counted_once() {
    let ir = ir();
    let mut db = database(&ir);
    let (_, function, block) = function_in_file(&ir, &mut db);
    let referrer = db.create_element(ir.get_value).unwrap();
    db.move_to(referrer, block, ir.statements).unwrap();
    let always = move |_: &Database, _: ElementId| Some(function);

    for _ in 0..3 {
        db.register_back_reference(function, referrer).unwrap();
    }
    db.set_reference(referrer, ir.symbol, Some(function)).unwrap();
    assert_eq!(db.get_back_references(function, &always).unwrap(), vec![referrer]);
}

#[test]
fn back_references_of_detached_element_fail() {
    let ir = ir();
    let mut db = database(&ir);
    let (_, function, _) = function_in_file(&ir, &mut db);
    db.detach(function).unwrap();
    assert!(matches!(
        db.get_back_references(function, &ir.symbol),
        Err(StoreError::DetachedElement { .. })
    ));
}

// ---------------------------------------------------------------------------
// Kind index
// ---------------------------------------------------------------------------

#[test]
fn index_is_empty_until_element_is_marked() {
    let ir = ir();
    let mut db = database(&ir);
    let root = db.create_element(ir.function).unwrap();
    db.move_to_root(root).unwrap();
    db.set_indexing(root, true).unwrap();
    let child = db.create_element(ir.block).unwrap();
    db.move_to(child, root, ir.body).unwrap();

    assert_eq!(db.get_elements_with_index(ir.block).unwrap().count(), 0);
    db.set_indexing(child, true).unwrap();
    assert_eq!(
        db.get_elements_with_index(ir.block).unwrap().collect::<Vec<_>>(),
        vec![child]
    );
    assert_eq!(
        db.get_elements_with_index(ir.function).unwrap().collect::<Vec<_>>(),
        vec![root]
    );
}

#[test]
fn index_sequence_is_restartable() {
    let ir = ir();
    let mut db = database(&ir);
    let (file, _, _) = function_in_file(&ir, &mut db);
    for _ in 0..3 {
        let function = db.create_element(ir.function).unwrap();
        db.move_to(function, file, ir.declarations).unwrap();
        db.set_indexing(function, true).unwrap();
    }

    let sequence = db.get_elements_with_index(ir.function).unwrap();
    let first: Vec<_> = sequence.clone().collect();
    let second: Vec<_> = sequence.collect();
    assert_eq!(first.len(), 3);
    assert_eq!(first, second);
}

#[test]
fn unmarking_removes_from_index() {
    let ir = ir();
    let mut db = database(&ir);
    let (_, function, _) = function_in_file(&ir, &mut db);
    db.set_indexing(function, true).unwrap();
    assert_eq!(db.get_elements_with_index(ir.function).unwrap().count(), 1);
    db.set_indexing(function, false).unwrap();
    assert_eq!(db.get_elements_with_index(ir.function).unwrap().count(), 0);
}

// ---------------------------------------------------------------------------
// External modules
// ---------------------------------------------------------------------------

#[test]
fn local_and_external_indices_are_concatenated() {
    let ir = ir();
    let mut dependency = database(&ir);
    let (_, library_function, _) = function_in_file(&ir, &mut dependency);
    dependency.set_indexing(library_function, true).unwrap();
    let external = dependency.freeze().unwrap();

    let mut db = database(&ir);
    db.register_external_module(external.clone()).unwrap();
    let (_, function, block) = function_in_file(&ir, &mut db);
    db.set_indexing(function, true).unwrap();

    assert_eq!(
        db.get_elements_with_index_including_external(ir.function)
            .unwrap()
            .collect::<Vec<_>>(),
        vec![function, library_function]
    );
    assert_eq!(
        db.get_elements_with_index(ir.function).unwrap().collect::<Vec<_>>(),
        vec![function]
    );

    // External elements are read-only.
    assert!(matches!(
        db.move_to(library_function, block, ir.statements),
        Err(StoreError::IllegalMove { .. })
    ));
    assert!(matches!(
        db.set_indexing(library_function, false),
        Err(StoreError::IllegalMutation { .. })
    ));
    assert!(external.is_ancestor_of(external.database().roots()[0], library_function).unwrap());
}

#[test]
fn local_references_onto_external_declarations() {
    let ir = ir();
    let mut dependency = database(&ir);
    let (_, library_function, _) = function_in_file(&ir, &mut dependency);
    let external = dependency.freeze().unwrap();

    let mut db = database(&ir);
    db.register_external_module(external.clone()).unwrap();
    let (_, _, block) = function_in_file(&ir, &mut db);
    let read = db.create_element(ir.get_value).unwrap();
    db.move_to(read, block, ir.statements).unwrap();
    db.set_reference(read, ir.symbol, Some(library_function)).unwrap();

    assert_eq!(
        db.get_back_references(library_function, &ir.symbol).unwrap(),
        vec![read]
    );
    // The external database itself is untouched.
    assert!(external
        .get_back_references(library_function, &ir.symbol)
        .unwrap()
        .is_empty());
}

#[test]
fn external_database_is_readable_from_threads() {
    let ir = ir();
    let mut dependency = database(&ir);
    let (_, function, _) = function_in_file(&ir, &mut dependency);
    dependency.set_indexing(function, true).unwrap();
    let external = dependency.freeze().unwrap();
    let kind = ir.function;

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let external = external.clone();
            std::thread::spawn(move || external.get_elements_with_index(kind).count())
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), 1);
    }
}
