// SPDX-License-Identifier: AGPL-3.0-or-later
//! Benchmark for object marshaling.
//!
//! Measures building value trees from in-process class objects, with and
//! without embedded objects, and rendering them to JSON text.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use wbridgelib::provider::memory::{MemoryObject, MemoryProvider};
use wbridgelib::variant::{ArrayData, SafeArray, Variant};
use wbridgelib::{BridgeConfig, Marshaler, Session};

fn process(pid: i32) -> MemoryObject {
    MemoryObject::new("Win32_Process")
        .with("Name", "svchost.exe")
        .with("ProcessId", pid)
        .with("CommandLine", "C:\\Windows\\system32\\svchost.exe -k netsvcs -p")
        .with("Priority", 8)
        .with("ThreadCount", 37)
        .with("WorkingSetSize", "18432000")
}

fn bench_to_tree(c: &mut Criterion) {
    let marshaler = Marshaler::new();
    let flat = process(4242);
    let nested = MemoryObject::new("__InstanceModificationEvent")
        .with_object("TargetInstance", process(4242))
        .with_object("PreviousInstance", process(4242));

    c.bench_function("to_tree_flat", |b| {
        b.iter(|| black_box(marshaler.to_tree(&flat)));
    });
    c.bench_function("to_tree_nested", |b| {
        b.iter(|| black_box(marshaler.to_tree(&nested)));
    });
}

fn bench_array_text(c: &mut Criterion) {
    let marshaler = Marshaler::new();
    let bytes = Variant::Array(SafeArray::new(0, 1023, ArrayData::UI1((0..=255).cycle().take(1024).collect())));

    c.bench_function("array_text_1k", |b| {
        b.iter(|| black_box(marshaler.value_to_text(&bytes)));
    });
}

fn bench_query_render(c: &mut Criterion) {
    let provider = MemoryProvider::new();
    for pid in 0..200 {
        provider.insert("ROOT\\cimv2", process(pid));
    }
    let session = match Session::connect(Box::new(provider), BridgeConfig::default()) {
        Ok(session) => session,
        Err(_) => return,
    };

    c.bench_function("query_render_200", |b| {
        b.iter(|| {
            if let Ok(trees) = session.query_trees("cimv2\\Win32_Process") {
                for tree in &trees {
                    let _ = black_box(tree.render("\t"));
                }
            }
        });
    });
}

criterion_group!(benches, bench_to_tree, bench_array_text, bench_query_render);
criterion_main!(benches);
