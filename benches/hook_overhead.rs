//! Call-site hook overhead benchmark
//!
//! Measures what a host pays per call routed through the controller:
//!
//! 1. An un-hooked call site (no active session, or site not selected)
//! 2. A hooked call site (pre-call, post-call, window record)
//! 3. A nested call into the same module (depth counter only)
//!
//! # Run Instructions
//!
//! ```bash
//! cargo bench --bench hook_overhead
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use modperf::hooks::HookTable;
use modperf::module::TypeDescriptor;
use modperf::synth::ModuleBinary;
use modperf::{InterceptionController, ModuleDescriptor, MonitorConfig};
use std::sync::Arc;
use tempfile::TempDir;

/// A single extension module with one hookable method
fn setup(dir: &TempDir) -> (InterceptionController, ModuleDescriptor) {
    let path = dir.path().join("bench.o");
    ModuleBinary::new()
        .function("BenchMod::update", 64)
        .function("BenchMod::render", 64)
        .write_to(&path)
        .unwrap();
    let module = ModuleDescriptor::from_binary(&path, "bench").with_type(
        TypeDescriptor::new("BenchMod")
            .extends("ModBehaviour")
            .with_methods(["update", "render"]),
    );
    let controller = InterceptionController::new(MonitorConfig::default())
        .with_hook_table(Arc::new(HookTable::new()));
    (controller, module)
}

fn bench_unhooked_call(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let (controller, module) = setup(&dir);
    let site = module.call_site("BenchMod", "update");

    c.bench_function("unhooked_call", |b| {
        b.iter(|| controller.call(black_box(&site), || black_box(1)));
    });
}

fn bench_hooked_call(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let (controller, module) = setup(&dir);
    controller.initialize(&vec![module.clone()]);
    let site = module.call_site("BenchMod", "update");

    c.bench_function("hooked_call", |b| {
        b.iter(|| controller.call(black_box(&site), || black_box(1)));
    });

    controller.cleanup();
}

fn bench_nested_calls(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let (controller, module) = setup(&dir);
    controller.initialize(&vec![module.clone()]);
    let update = module.call_site("BenchMod", "update");
    let render = module.call_site("BenchMod", "render");

    let mut group = c.benchmark_group("nested_calls");
    for depth in [1u32, 4, 16] {
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &depth| {
            b.iter(|| {
                controller.call(&update, || {
                    for _ in 0..depth {
                        controller.call(&render, || black_box(1));
                    }
                })
            });
        });
    }
    group.finish();

    controller.cleanup();
}

criterion_group!(
    benches,
    bench_unhooked_call,
    bench_hooked_call,
    bench_nested_calls
);
criterion_main!(benches);
