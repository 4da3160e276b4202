//! End-to-end analysis over synthetic dumps: build, query, reopen.

mod common;

use std::fs;
use std::path::Path;

use common::*;
use hprof_retain::{
    AnalysisOptions, CancelToken, Dominator, HprofRetainError, ObjectKind, RootKind, Snapshot,
};

const NODE_CLASS: u64 = 0x100;
const PAIR_CLASS: u64 = 0x200;

fn options() -> AnalysisOptions {
    AnalysisOptions::default().with_memory_budget(64 * 1024 * 1024)
}

/// One class with a single object field, named like a real dump would name it.
fn node_class_records(builder: DumpBuilder) -> DumpBuilder {
    builder
        .string(1, "com/example/Node")
        .string(2, "next")
        .load_class(1, NODE_CLASS, 1)
        .class(NODE_CLASS, 0, 8, &[2], &[])
}

fn write_dump(dir: &Path, name: &str, bytes: &[u8]) -> std::path::PathBuf {
    let path = dir.join(name);
    fs::write(&path, bytes).unwrap();
    path
}

#[test]
fn cycle_collapses_and_every_member_retains_the_sum() {
    let tmp = tempfile::tempdir().unwrap();
    // A -> B -> C -> A, rooted at A
    let dump = node_class_records(DumpBuilder::new())
        .instance(0x1, NODE_CLASS, &[0x2])
        .instance(0x2, NODE_CLASS, &[0x3])
        .instance(0x3, NODE_CLASS, &[0x1])
        .root(0x1)
        .build();
    let path = write_dump(tmp.path(), "cycle.hprof", &dump);
    let snapshot = Snapshot::open(&path, &options()).unwrap();

    // ids follow stream order: class object 0, then A, B, C
    let a = snapshot.object_id_of(0x1).unwrap().unwrap();
    let b = snapshot.object_id_of(0x2).unwrap().unwrap();
    let c = snapshot.object_id_of(0x3).unwrap().unwrap();
    assert_eq!((a, b, c), (1, 2, 3));

    let shallow = snapshot.shallow_size(a).unwrap();
    assert_eq!(shallow, 24); // 16-byte header + one 8-byte field
    for id in [a, b, c] {
        assert_eq!(snapshot.retained_size(id).unwrap(), 3 * shallow);
        assert_eq!(
            snapshot.immediate_dominator(id).unwrap(),
            Dominator::SyntheticRoot
        );
    }

    // the class object is not referenced by anything: unreachable garbage
    assert_eq!(snapshot.unreachable_count(), 1);
    assert_eq!(snapshot.immediate_dominator(0).unwrap(), Dominator::Unreachable);
    assert_eq!(snapshot.retained_size(0).unwrap(), 0);

    // reference indices, both directions
    assert_eq!(snapshot.outbound_references(a).unwrap(), vec![b]);
    assert_eq!(snapshot.inbound_references(b).unwrap(), vec![a]);
    assert_eq!(snapshot.inbound_references(a).unwrap(), vec![c]);
}

#[test]
fn exclusive_chain_dominates_and_sums() {
    let tmp = tempfile::tempdir().unwrap();
    // root -> Y -> X
    let dump = node_class_records(DumpBuilder::new())
        .instance(0x10, NODE_CLASS, &[0x20]) // Y
        .instance(0x20, NODE_CLASS, &[0]) // X, null next
        .root(0x10)
        .build();
    let path = write_dump(tmp.path(), "chain.hprof", &dump);
    let snapshot = Snapshot::open(&path, &options()).unwrap();

    let y = snapshot.object_id_of(0x10).unwrap().unwrap();
    let x = snapshot.object_id_of(0x20).unwrap().unwrap();

    assert_eq!(snapshot.immediate_dominator(y).unwrap(), Dominator::SyntheticRoot);
    assert_eq!(snapshot.immediate_dominator(x).unwrap(), Dominator::Object(y));
    assert_eq!(
        snapshot.retained_size(y).unwrap(),
        snapshot.shallow_size(y).unwrap() + snapshot.shallow_size(x).unwrap()
    );
    assert_eq!(
        snapshot.retained_size(x).unwrap(),
        snapshot.shallow_size(x).unwrap()
    );
}

#[test]
fn mutual_pair_is_dominated_by_its_shared_referrer() {
    let tmp = tempfile::tempdir().unwrap();
    // Z -> {X, Y}; X and Y reference each other; root -> Z
    let dump = node_class_records(DumpBuilder::new())
        .string(3, "com/example/Pair")
        .string(4, "left")
        .string(5, "right")
        .load_class(2, PAIR_CLASS, 3)
        .class(PAIR_CLASS, 0, 16, &[4, 5], &[])
        .instance(0x30, PAIR_CLASS, &[0x31, 0x32]) // Z
        .instance(0x31, NODE_CLASS, &[0x32]) // X
        .instance(0x32, NODE_CLASS, &[0x31]) // Y
        .root(0x30)
        .build();
    let path = write_dump(tmp.path(), "pair.hprof", &dump);
    let snapshot = Snapshot::open(&path, &options()).unwrap();

    let z = snapshot.object_id_of(0x30).unwrap().unwrap();
    let x = snapshot.object_id_of(0x31).unwrap().unwrap();
    let y = snapshot.object_id_of(0x32).unwrap().unwrap();

    assert_eq!(snapshot.immediate_dominator(x).unwrap(), Dominator::Object(z));
    assert_eq!(snapshot.immediate_dominator(y).unwrap(), Dominator::Object(z));

    let pair_total = snapshot.shallow_size(x).unwrap() + snapshot.shallow_size(y).unwrap();
    assert_eq!(snapshot.retained_size(x).unwrap(), pair_total);
    assert_eq!(snapshot.retained_size(y).unwrap(), pair_total);
    assert_eq!(
        snapshot.retained_size(z).unwrap(),
        snapshot.shallow_size(z).unwrap() + pair_total
    );
}

#[test]
fn retained_size_identity_holds_on_a_tree() {
    let tmp = tempfile::tempdir().unwrap();
    // root -> R; R -> {A, B}; A -> C
    let dump = node_class_records(DumpBuilder::new())
        .string(3, "com/example/Pair")
        .string(4, "left")
        .string(5, "right")
        .load_class(2, PAIR_CLASS, 3)
        .class(PAIR_CLASS, 0, 16, &[4, 5], &[])
        .instance(0x40, PAIR_CLASS, &[0x41, 0x42]) // R
        .instance(0x41, NODE_CLASS, &[0x43]) // A
        .instance(0x42, NODE_CLASS, &[0]) // B
        .instance(0x43, NODE_CLASS, &[0]) // C
        .root(0x40)
        .build();
    let path = write_dump(tmp.path(), "tree.hprof", &dump);
    let snapshot = Snapshot::open(&path, &options()).unwrap();

    // reconstruct dominator children and check the additive identity
    let count = snapshot.object_count();
    for id in 0..count {
        if snapshot.immediate_dominator(id).unwrap() == Dominator::Unreachable {
            continue;
        }
        let shallow = snapshot.shallow_size(id).unwrap();
        let retained = snapshot.retained_size(id).unwrap();
        assert!(retained >= shallow);

        let children_sum: u64 = (0..count)
            .filter(|&child| {
                snapshot.immediate_dominator(child).unwrap() == Dominator::Object(id)
            })
            .map(|child| snapshot.retained_size(child).unwrap())
            .sum();
        assert_eq!(retained, shallow + children_sum);
    }

    // roots sum to the total reachable size
    let roots_sum: u64 = (0..count)
        .filter(|&id| snapshot.immediate_dominator(id).unwrap() == Dominator::SyntheticRoot)
        .map(|id| snapshot.retained_size(id).unwrap())
        .sum();
    assert_eq!(roots_sum, snapshot.total_retained_bytes());
}

#[test]
fn class_statics_reference_and_retain() {
    let tmp = tempfile::tempdir().unwrap();
    // class K holds S through a static; K is a sticky-class root
    let dump = DumpBuilder::new()
        .string(1, "com/example/Holder")
        .string(2, "INSTANCE")
        .load_class(1, NODE_CLASS, 1)
        .class(NODE_CLASS, 0, 0, &[], &[(2, 0x50)])
        .instance(0x50, NODE_CLASS, &[])
        .sticky_class_root(NODE_CLASS)
        .build();
    let path = write_dump(tmp.path(), "statics.hprof", &dump);
    let snapshot = Snapshot::open(&path, &options()).unwrap();

    let k = snapshot.object_id_of(NODE_CLASS).unwrap().unwrap();
    let s = snapshot.object_id_of(0x50).unwrap().unwrap();
    assert_eq!(snapshot.object_kind(k).unwrap(), ObjectKind::Class);
    assert_eq!(snapshot.outbound_references(k).unwrap(), vec![s]);
    assert_eq!(snapshot.immediate_dominator(s).unwrap(), Dominator::Object(k));
    assert_eq!(
        snapshot.retained_size(k).unwrap(),
        snapshot.shallow_size(k).unwrap() + snapshot.shallow_size(s).unwrap()
    );

    let roots = snapshot.gc_roots();
    assert_eq!(roots.len(), 1);
    assert_eq!(roots[0].kind, RootKind::StickyClass);
    assert_eq!(roots[0].object_id, k);
}

#[test]
fn arrays_index_like_any_other_object() {
    let tmp = tempfile::tempdir().unwrap();
    let dump = node_class_records(DumpBuilder::new())
        .instance(0x60, NODE_CLASS, &[0])
        .instance(0x61, NODE_CLASS, &[0])
        .object_array(0x70, NODE_CLASS, &[0x60, 0, 0x61])
        .primitive_array(0x71, 8, &[0u8; 5]) // byte[5]
        .root(0x70)
        .root(0x71)
        .build();
    let path = write_dump(tmp.path(), "arrays.hprof", &dump);
    let snapshot = Snapshot::open(&path, &options()).unwrap();

    let arr = snapshot.object_id_of(0x70).unwrap().unwrap();
    let bytes = snapshot.object_id_of(0x71).unwrap().unwrap();
    let e0 = snapshot.object_id_of(0x60).unwrap().unwrap();
    let e1 = snapshot.object_id_of(0x61).unwrap().unwrap();

    assert_eq!(snapshot.object_kind(arr).unwrap(), ObjectKind::ObjectArray);
    assert_eq!(snapshot.outbound_references(arr).unwrap(), vec![e0, e1]);
    // 16-byte header + 3 references
    assert_eq!(snapshot.shallow_size(arr).unwrap(), 40);

    assert_eq!(snapshot.object_kind(bytes).unwrap(), ObjectKind::PrimitiveArray);
    assert_eq!(&*snapshot.class_of(bytes).unwrap().name, "byte[]");
    // 16-byte header + 5 bytes, padded to 24
    assert_eq!(snapshot.shallow_size(bytes).unwrap(), 24);
    assert!(snapshot.outbound_references(bytes).unwrap().is_empty());
}

#[test]
fn unresolved_references_become_nulls_not_failures() {
    let tmp = tempfile::tempdir().unwrap();
    let dump = node_class_records(DumpBuilder::new())
        .instance(0x80, NODE_CLASS, &[0xDEAD]) // target never dumped
        .root(0x80)
        .build();
    let path = write_dump(tmp.path(), "dangling.hprof", &dump);
    let snapshot = Snapshot::open(&path, &options()).unwrap();

    let holder = snapshot.object_id_of(0x80).unwrap().unwrap();
    assert!(snapshot.outbound_references(holder).unwrap().is_empty());
    assert!(snapshot.unresolved_reference_count() >= 1);
    assert_eq!(
        snapshot.retained_size(holder).unwrap(),
        snapshot.shallow_size(holder).unwrap()
    );
}

#[test]
fn object_ids_are_deterministic_across_builds() {
    let tmp = tempfile::tempdir().unwrap();
    let dump = node_class_records(DumpBuilder::new())
        .instance(0x1, NODE_CLASS, &[0x2])
        .instance(0x2, NODE_CLASS, &[0x3])
        .instance(0x3, NODE_CLASS, &[0x1])
        .root(0x1)
        .build();
    let first = Snapshot::open(&write_dump(tmp.path(), "a.hprof", &dump), &options()).unwrap();
    let second = Snapshot::open(&write_dump(tmp.path(), "b.hprof", &dump), &options()).unwrap();

    assert_eq!(first.object_count(), second.object_count());
    for id in 0..first.object_count() {
        assert_eq!(
            first.identifier_of(id).unwrap(),
            second.identifier_of(id).unwrap()
        );
        assert_eq!(
            first.outbound_references(id).unwrap(),
            second.outbound_references(id).unwrap()
        );
        assert_eq!(first.retained_size(id).unwrap(), second.retained_size(id).unwrap());
    }
}

#[test]
fn reopening_a_built_index_yields_identical_results() {
    let tmp = tempfile::tempdir().unwrap();
    let dump = node_class_records(DumpBuilder::new())
        .instance(0x1, NODE_CLASS, &[0x2])
        .instance(0x2, NODE_CLASS, &[0])
        .root(0x1)
        .build();
    let path = write_dump(tmp.path(), "reopen.hprof", &dump);

    let (first, stats) = Snapshot::open_with_progress(&path, &options(), None).unwrap();
    assert!(stats.is_some(), "first open must build");
    let count = first.object_count();
    let baseline: Vec<_> = (0..count)
        .map(|id| {
            (
                first.class_of(id).unwrap().name.clone(),
                first.outbound_references(id).unwrap(),
                first.retained_size(id).unwrap(),
            )
        })
        .collect();
    first.close();

    let (second, stats) = Snapshot::open_with_progress(&path, &options(), None).unwrap();
    assert!(stats.is_none(), "second open must reuse the index");
    for id in 0..count {
        let (name, outbound, retained) = &baseline[id as usize];
        assert_eq!(&second.class_of(id).unwrap().name, name);
        assert_eq!(&second.outbound_references(id).unwrap(), outbound);
        assert_eq!(second.retained_size(id).unwrap(), *retained);
    }
}

#[test]
fn modified_dump_triggers_a_rebuild() {
    let tmp = tempfile::tempdir().unwrap();
    let small = node_class_records(DumpBuilder::new())
        .instance(0x1, NODE_CLASS, &[0])
        .root(0x1)
        .build();
    let path = write_dump(tmp.path(), "stale.hprof", &small);
    let (snapshot, _) = Snapshot::open_with_progress(&path, &options(), None).unwrap();
    assert_eq!(snapshot.object_count(), 2);
    snapshot.close();

    let bigger = node_class_records(DumpBuilder::new())
        .instance(0x1, NODE_CLASS, &[0x2])
        .instance(0x2, NODE_CLASS, &[0])
        .root(0x1)
        .build();
    fs::write(&path, &bigger).unwrap();
    let (snapshot, stats) = Snapshot::open_with_progress(&path, &options(), None).unwrap();
    assert!(stats.is_some(), "stale index must be rebuilt");
    assert_eq!(snapshot.object_count(), 3);
}

#[test]
fn truncated_dump_reports_the_incomplete_record_offset() {
    let tmp = tempfile::tempdir().unwrap();
    let mut stream = file_header();
    let mut body = 0x9u64.to_be_bytes().to_vec();
    body.extend_from_slice(b"intact");
    stream.extend_from_slice(&record(TAG_STRING, &body));
    let expected_offset = stream.len() as u64;
    // a record that declares 64 body bytes but the file ends after 10
    let mut truncated = vec![TAG_STRING];
    truncated.extend_from_slice(&0u32.to_be_bytes());
    truncated.extend_from_slice(&64u32.to_be_bytes());
    truncated.extend_from_slice(&[0u8; 10]);
    stream.extend_from_slice(&truncated);

    let path = write_dump(tmp.path(), "truncated.hprof", &stream);
    let err = Snapshot::open(&path, &options()).unwrap_err();
    match err {
        HprofRetainError::MalformedDump { offset, .. } => assert_eq!(offset, expected_offset),
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn unsupported_version_names_the_found_string() {
    let tmp = tempfile::tempdir().unwrap();
    let mut stream = Vec::new();
    stream.extend_from_slice(b"JAVA PROFILE 1.0.3");
    stream.push(0);
    stream.extend_from_slice(&8u32.to_be_bytes());
    stream.extend_from_slice(&0u64.to_be_bytes());

    let path = write_dump(tmp.path(), "future.hprof", &stream);
    let err = Snapshot::open(&path, &options()).unwrap_err();
    match err {
        HprofRetainError::UnsupportedFormatVersion { found } => {
            assert_eq!(found, "JAVA PROFILE 1.0.3")
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn cancellation_publishes_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let dump = node_class_records(DumpBuilder::new())
        .instance(0x1, NODE_CLASS, &[0])
        .root(0x1)
        .build();
    let path = write_dump(tmp.path(), "cancelled.hprof", &dump);
    let index_dir = tmp.path().join("cancelled.hpridx");

    let cancel = CancelToken::new();
    cancel.cancel();
    let cancelled_options = options().with_cancel(cancel);
    let err = Snapshot::open_dump_at(&path, &index_dir, &cancelled_options, None).unwrap_err();
    assert!(matches!(err, HprofRetainError::Cancelled));

    // nothing was published: a later open finds no index, not a corrupt one
    let err = Snapshot::open_index(&index_dir, &options()).unwrap_err();
    assert!(matches!(err, HprofRetainError::IndexMissing { .. }));
}

#[test]
fn corrupted_index_file_is_detected_on_open() {
    let tmp = tempfile::tempdir().unwrap();
    let dump = node_class_records(DumpBuilder::new())
        .instance(0x1, NODE_CLASS, &[0])
        .root(0x1)
        .build();
    let path = write_dump(tmp.path(), "corrupt.hprof", &dump);
    let snapshot = Snapshot::open(&path, &options()).unwrap();
    snapshot.close();

    // flip one byte in the retained index, past the header
    let retained_path = tmp.path().join("corrupt.hpridx").join("retained.idx");
    let mut bytes = fs::read(&retained_path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    fs::write(&retained_path, &bytes).unwrap();

    let err = Snapshot::open_index(&tmp.path().join("corrupt.hpridx"), &options()).unwrap_err();
    assert!(matches!(err, HprofRetainError::IndexCorrupt { .. }));
}

#[test]
fn report_renders_suspects() {
    let tmp = tempfile::tempdir().unwrap();
    let dump = node_class_records(DumpBuilder::new())
        .instance(0x1, NODE_CLASS, &[0x2])
        .instance(0x2, NODE_CLASS, &[0])
        .root(0x1)
        .build();
    let path = write_dump(tmp.path(), "report.hprof", &dump);
    let snapshot = Snapshot::open(&path, &options()).unwrap();

    let classes = hprof_retain::report::render_top_classes(&snapshot, 10).unwrap();
    assert!(classes.contains("com.example.Node"));
    let objects = hprof_retain::report::render_top_objects(&snapshot, 10).unwrap();
    assert!(objects.contains("0x1"));
    let summary = hprof_retain::report::render_summary(&snapshot);
    assert!(summary.contains("GC roots: 1"));
}
