//! WAT fixtures implementing the denoiser module ABI.
//!
//! The fixture model is a per-instance leaky integrator:
//! `state = 0.9 * state + 0.1 * x`, `y = x - state`. It holds recurrent
//! state per handle, so stream isolation and ordering are observable.
//!
//! Linear memory layout:
//!
//! | Bytes | Contents |
//! |-------|----------|
//! | 0..16 | random bytes drawn at startup |
//! | 64..96 | live flag per slot (8 slots) |
//! | 96..128 | active buffer region per slot |
//! | 128..160 | integrator state per slot |
//! | 1024.. | two 2048-byte buffer regions per slot |

#![allow(dead_code)]

use dtln_bridge::{Block, BLOCK_SIZE};

/// Slots available in the fixture.
pub const SLOTS: usize = 8;

/// Fixture behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fixture {
    /// One fixed buffer region per handle
    Stable,
    /// The buffer region moves on every query
    Relocating,
    /// The reported region runs past the end of linear memory
    OutOfBounds,
    /// The processing entry point always reports status 7
    Failing,
    /// Processing burns time before doing the work
    Slow,
}

/// Module text for `fixture`.
pub fn fixture_wat(fixture: Fixture) -> String {
    let relocate = match fixture {
        Fixture::Relocating => {
            "(local.set $flip (i32.xor (local.get $flip) (i32.const 1)))
             (i32.store offset=96 (i32.shl (local.get $h) (i32.const 2)) (local.get $flip))"
        }
        _ => "",
    };
    let region = match fixture {
        Fixture::OutOfBounds => "(i32.const 65000)",
        _ => "(call $region (local.get $h) (local.get $flip))",
    };
    let prologue = match fixture {
        Fixture::Failing => "(return (i32.const 7))",
        Fixture::Slow => {
            "(local.set $spin (i32.const 20000000))
             (block $spun
               (loop $spinning
                 (br_if $spun (i32.eqz (local.get $spin)))
                 (local.set $spin (i32.sub (local.get $spin) (i32.const 1)))
                 (br $spinning)))"
        }
        _ => "",
    };

    format!(
        r#"(module
  (import "dtln_env" "random_fill" (func $random_fill (param i32 i32) (result i32)))
  (import "dtln_env" "now_ms" (func $now_ms (result f64)))
  (memory (export "memory") 1)
  (global $ready (mut i32) (i32.const 0))
  (global $started_at (mut f64) (f64.const 0))

  (func (export "_initialize")
    (if (i32.ne (call $random_fill (i32.const 0) (i32.const 16)) (i32.const 0))
      (then (unreachable)))
    (global.set $started_at (call $now_ms))
    (global.set $ready (i32.const 1)))

  (func $region (param $slot i32) (param $which i32) (result i32)
    (i32.add (i32.const 1024)
      (i32.mul
        (i32.add (i32.shl (local.get $slot) (i32.const 1)) (local.get $which))
        (i32.const 2048))))

  (func (export "dtln_create_wasm") (result i32)
    (local $slot i32)
    (if (i32.eqz (global.get $ready)) (then (return (i32.const -1))))
    (block $full
      (loop $scan
        (br_if $full (i32.ge_u (local.get $slot) (i32.const {slots})))
        (if (i32.eqz (i32.load offset=64 (i32.shl (local.get $slot) (i32.const 2))))
          (then
            (i32.store offset=64 (i32.shl (local.get $slot) (i32.const 2)) (i32.const 1))
            (i32.store offset=96 (i32.shl (local.get $slot) (i32.const 2)) (i32.const 0))
            (f32.store offset=128 (i32.shl (local.get $slot) (i32.const 2)) (f32.const 0))
            (return (local.get $slot))))
        (local.set $slot (i32.add (local.get $slot) (i32.const 1)))
        (br $scan)))
    (i32.const -1))

  (func (export "dtln_get_audio_buffer") (param $h i32) (result i32)
    (local $flip i32)
    (local.set $flip (i32.load offset=96 (i32.shl (local.get $h) (i32.const 2))))
    {relocate}
    {region})

  (func (export "dtln_denoise_wasm") (param $h i32) (result i32)
    (local $ptr i32)
    (local $end i32)
    (local $state f32)
    (local $x f32)
    (local $spin i32)
    {prologue}
    (if (i32.ge_u (local.get $h) (i32.const {slots})) (then (return (i32.const 2))))
    (if (i32.eqz (i32.load offset=64 (i32.shl (local.get $h) (i32.const 2))))
      (then (return (i32.const 1))))
    (local.set $ptr
      (call $region (local.get $h) (i32.load offset=96 (i32.shl (local.get $h) (i32.const 2)))))
    (local.set $end (i32.add (local.get $ptr) (i32.const 2048)))
    (local.set $state (f32.load offset=128 (i32.shl (local.get $h) (i32.const 2))))
    (block $done
      (loop $samples
        (br_if $done (i32.ge_u (local.get $ptr) (local.get $end)))
        (local.set $x (f32.load (local.get $ptr)))
        (local.set $state
          (f32.add
            (f32.mul (local.get $state) (f32.const 0.9))
            (f32.mul (local.get $x) (f32.const 0.1))))
        (f32.store (local.get $ptr) (f32.sub (local.get $x) (local.get $state)))
        (local.set $ptr (i32.add (local.get $ptr) (i32.const 4)))
        (br $samples)))
    (f32.store offset=128 (i32.shl (local.get $h) (i32.const 2)) (local.get $state))
    (i32.const 0))

  (func (export "dtln_destroy_wasm") (param $h i32)
    (if (i32.lt_u (local.get $h) (i32.const {slots}))
      (then (i32.store offset=64 (i32.shl (local.get $h) (i32.const 2)) (i32.const 0)))))
)"#,
        slots = SLOTS,
        relocate = relocate,
        region = region,
        prologue = prologue,
    )
}

/// Module text missing the instance release export.
pub fn incomplete_wat() -> &'static str {
    r#"(module
  (memory (export "memory") 1)
  (func (export "dtln_create_wasm") (result i32) (i32.const 0))
  (func (export "dtln_get_audio_buffer") (param i32) (result i32) (i32.const 1024))
  (func (export "dtln_denoise_wasm") (param i32) (result i32) (i32.const 0)))"#
}

/// Same integrator as the fixture, computed on the host.
pub fn reference_denoise(blocks: &[Block]) -> Vec<Block> {
    let mut state = 0.0f32;
    blocks
        .iter()
        .map(|block| {
            let mut out = [0.0f32; BLOCK_SIZE];
            for (y, &x) in out.iter_mut().zip(block.iter()) {
                state = state * 0.9 + x * 0.1;
                *y = x - state;
            }
            out
        })
        .collect()
}

/// Deterministic test signal: a sine with a per-block offset.
pub fn signal(blocks: usize, seed: f32) -> Vec<Block> {
    (0..blocks)
        .map(|b| {
            let mut block = [0.0f32; BLOCK_SIZE];
            for (i, s) in block.iter_mut().enumerate() {
                let n = (b * BLOCK_SIZE + i) as f32;
                *s = (n * 0.05 + seed).sin() * 0.5 + seed * 0.01;
            }
            block
        })
        .collect()
}
