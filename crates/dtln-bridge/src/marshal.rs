//! Audio buffer marshalling.
//!
//! One call moves one block through the native instance in place. The
//! Shared Buffer Region offset is asked for on every call and never kept:
//! the guest may move the region between blocks.
//!
//! Block length is fixed by the [`Block`] type. Slices coming from the
//! caller are converted once at the boundary with [`check_block`] and
//! [`check_block_mut`]; nothing inside [`NativeModule::process`] re-checks
//! it. A successful call performs no heap allocation.

use crate::error::{BridgeError, Result};
use crate::lifecycle::Handle;
use crate::runtime::{call_error, NativeModule};
use crate::{Block, BLOCK_SIZE};

/// View a caller slice as one block, rejecting any other length.
pub fn check_block(samples: &[f32]) -> Result<&Block> {
    samples.try_into().map_err(|_| BridgeError::BlockSize {
        expected: BLOCK_SIZE,
        actual: samples.len(),
    })
}

/// Mutable counterpart of [`check_block`].
pub fn check_block_mut(samples: &mut [f32]) -> Result<&mut Block> {
    let actual = samples.len();
    samples.try_into().map_err(|_| BridgeError::BlockSize {
        expected: BLOCK_SIZE,
        actual,
    })
}

impl NativeModule {
    /// Denoise one block for `handle`.
    ///
    /// Blocks must arrive in stream order; the instance's recurrent state
    /// advances on every call.
    pub fn process(&mut self, handle: &Handle, input: &Block, output: &mut Block) -> Result<()> {
        self.refuel(self.block_fuel)?;

        let offset = self
            .audio_buffer_fn
            .call(&mut self.store, handle.id())
            .map_err(call_error)?;
        self.write_block(offset, input)?;

        let status = self
            .denoise_fn
            .call(&mut self.store, handle.id())
            .map_err(call_error)?;
        if status != 0 {
            return Err(BridgeError::NativeStatus(status));
        }

        self.read_block(offset, output)
    }

    /// [`process`](Self::process) for caller slices of unchecked length.
    pub fn process_slice(
        &mut self,
        handle: &Handle,
        input: &[f32],
        output: &mut [f32],
    ) -> Result<()> {
        let input = check_block(input)?;
        let output = check_block_mut(output)?;
        self.process(handle, input, output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_block_accepts_exact_length() {
        let samples = vec![0.25f32; BLOCK_SIZE];
        let block = check_block(&samples).unwrap();
        assert_eq!(block[BLOCK_SIZE - 1], 0.25);
    }

    #[test]
    fn test_check_block_rejects_other_lengths() {
        for len in [0, 1, BLOCK_SIZE - 1, BLOCK_SIZE + 1, 2 * BLOCK_SIZE] {
            let samples = vec![0.0f32; len];
            match check_block(&samples) {
                Err(BridgeError::BlockSize { expected, actual }) => {
                    assert_eq!(expected, BLOCK_SIZE);
                    assert_eq!(actual, len);
                }
                other => panic!("expected BlockSize error for {}, got {:?}", len, other.map(|_| ())),
            }
        }
    }

    #[test]
    fn test_check_block_mut_rejects_short_output() {
        let mut samples = vec![0.0f32; 128];
        assert!(matches!(
            check_block_mut(&mut samples),
            Err(BridgeError::BlockSize { actual: 128, .. })
        ));
    }
}
