//! Steady-state processing must not touch the heap or slow down over time.

mod common;

use common::{fixture_wat, signal, Fixture};
use dtln_bridge::{BridgeConfig, ContextSelection, DenoiseBridge, BLOCK_SIZE};
use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

struct CountingAlloc;

static ALLOCATIONS: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    // Tests run in parallel; only the thread under measurement is counted.
    static COUNTING: Cell<bool> = const { Cell::new(false) };
}

unsafe impl GlobalAlloc for CountingAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { System.alloc(layout) };
        if !ptr.is_null() && COUNTING.try_with(Cell::get).unwrap_or(false) {
            ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { System.dealloc(ptr, layout) };
    }
}

#[global_allocator]
static GLOBAL: CountingAlloc = CountingAlloc;

/// Allocations made on this thread while `f` runs.
fn count_allocations(f: impl FnOnce()) -> usize {
    let before = ALLOCATIONS.load(Ordering::Relaxed);
    COUNTING.with(|c| c.set(true));
    f();
    COUNTING.with(|c| c.set(false));
    ALLOCATIONS.load(Ordering::Relaxed) - before
}

fn load(fixture: Fixture, config: BridgeConfig) -> DenoiseBridge {
    DenoiseBridge::load(config, fixture_wat(fixture).as_bytes()).expect("failed to load fixture")
}

fn host_config() -> BridgeConfig {
    BridgeConfig::default()
        .context(ContextSelection::Host)
        .optimize(0)
}

fn assert_no_allocations(config: BridgeConfig) {
    let mut bridge = load(Fixture::Relocating, config);
    let handle = bridge.create().unwrap();
    let input = signal(4, 0.7);
    let mut output = [0.0f32; BLOCK_SIZE];

    // Warm-up: lazy initialisation in dependencies happens before counting.
    for block in &input {
        bridge.process(&handle, block, &mut output).unwrap();
    }

    let mut failures = 0usize;
    let allocations = count_allocations(|| {
        for i in 0..1000 {
            if bridge
                .process(&handle, &input[i % input.len()], &mut output)
                .is_err()
            {
                failures += 1;
            }
        }
    });

    assert_eq!(failures, 0);
    assert_eq!(allocations, 0, "process allocated on the block path");
    bridge.destroy(handle);
}

#[test]
fn test_process_does_not_allocate() {
    assert_no_allocations(host_config());
}

#[test]
fn test_process_with_fuel_does_not_allocate() {
    assert_no_allocations(host_config().block_fuel(1_000_000));
}

#[test]
fn test_slice_process_does_not_allocate() {
    let mut bridge = load(Fixture::Stable, host_config());
    let handle = bridge.create().unwrap();
    let input = vec![0.5f32; BLOCK_SIZE];
    let mut output = vec![0.0f32; BLOCK_SIZE];
    bridge.process_slice(&handle, &input, &mut output).unwrap();

    let allocations = count_allocations(|| {
        for _ in 0..200 {
            bridge.process_slice(&handle, &input, &mut output).unwrap();
        }
    });

    assert_eq!(allocations, 0);
    bridge.destroy(handle);
}

fn median(window: &mut [Duration]) -> Duration {
    window.sort_unstable();
    window[window.len() / 2]
}

#[test]
fn test_latency_does_not_drift() {
    let mut bridge = load(Fixture::Relocating, host_config());
    let handle = bridge.create().unwrap();
    let input = signal(8, 0.2);
    let memory_before = bridge.module().unwrap().memory_bytes();

    let mut output = [0.0f32; BLOCK_SIZE];
    let mut timings = Vec::with_capacity(6000);
    for i in 0..6000 {
        let start = Instant::now();
        bridge
            .process(&handle, &input[i % input.len()], &mut output)
            .unwrap();
        timings.push(start.elapsed());
    }

    // Skip the first blocks while caches warm up.
    let early = median(&mut timings[200..1200]);
    let late = median(&mut timings[5000..6000]);
    assert!(
        late <= early * 3 + Duration::from_micros(50),
        "late median {:?} vs early median {:?}",
        late,
        early
    );

    assert_eq!(bridge.module().unwrap().memory_bytes(), memory_before);
    assert_eq!(bridge.live_instances(), 1);
    bridge.destroy(handle);
}
