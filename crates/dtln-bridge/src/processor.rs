//! Stream processors built on the bridge.
//!
//! [`ImmediateProcessor`] denoises arbitrary-length buffers synchronously.
//! [`DeferredProcessor`] moves the bridge to a worker thread and trades one
//! block of latency for a caller that never runs the model itself.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::bridge::DenoiseBridge;
use crate::error::{BridgeError, Result};
use crate::lifecycle::Handle;
use crate::{Block, BLOCK_SIZE};

/// Blocks in flight between caller and worker, in each direction.
const QUEUE_DEPTH: usize = 2;

/// Output of one [`DeferredProcessor::denoise`] call.
#[derive(Debug, Clone)]
pub struct DenoiseResult {
    /// Denoised samples, or silence when nothing was ready
    pub samples: Block,
    /// The worker did not keep up with the stream
    pub processor_starved: bool,
}

impl DenoiseResult {
    fn silence(processor_starved: bool) -> Self {
        Self {
            samples: [0.0; BLOCK_SIZE],
            processor_starved,
        }
    }
}

/// Synchronous processor for buffers of any length.
pub struct ImmediateProcessor {
    bridge: DenoiseBridge,
    handle: Option<Handle>,
}

impl ImmediateProcessor {
    /// Wait for `bridge` to be ready and open one stream on it.
    pub fn new(mut bridge: DenoiseBridge) -> Result<Self> {
        bridge.wait_ready()?;
        let handle = bridge.create()?;
        Ok(Self {
            bridge,
            handle: Some(handle),
        })
    }

    /// Denoise `samples`, continuing the stream from the previous call.
    ///
    /// A trailing partial block is zero-padded; the output has exactly
    /// `samples.len()` samples.
    pub fn denoise(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        let handle = self
            .handle
            .as_ref()
            .ok_or_else(|| BridgeError::ProcessorStopped("processor was stopped".to_string()))?;

        let mut output = Vec::with_capacity(samples.len());
        let mut input_block = [0.0f32; BLOCK_SIZE];
        let mut output_block = [0.0f32; BLOCK_SIZE];

        for chunk in samples.chunks(BLOCK_SIZE) {
            input_block[..chunk.len()].copy_from_slice(chunk);
            input_block[chunk.len()..].fill(0.0);
            self.bridge.process(handle, &input_block, &mut output_block)?;
            output.extend_from_slice(&output_block[..chunk.len()]);
        }

        Ok(output)
    }

    /// Underlying bridge.
    pub fn bridge(&self) -> &DenoiseBridge {
        &self.bridge
    }

    /// Destroy the stream. Further `denoise` calls fail.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.bridge.destroy(handle);
        }
    }
}

impl Drop for ImmediateProcessor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Processor that runs the model on a worker thread, one block behind.
///
/// `denoise(A)` returns silence, `denoise(B)` returns denoised A,
/// `denoise(C)` returns denoised B, and so on. When the worker misses the
/// block deadline the call returns silence with `processor_starved` set.
/// Results that arrive after their deadline are discarded, so once the
/// worker catches up the lag is back to one block.
pub struct DeferredProcessor {
    to_worker: Option<SyncSender<Block>>,
    from_worker: Receiver<Result<Block>>,
    worker: Option<JoinHandle<DenoiseBridge>>,
    first_block: bool,
    // submitted blocks whose results have not been received
    in_flight: usize,
    wait: Duration,
}

impl DeferredProcessor {
    /// Open one stream on `bridge` and move both onto a worker thread.
    pub fn spawn(mut bridge: DenoiseBridge) -> Result<Self> {
        bridge.wait_ready()?;
        let handle = bridge.create()?;
        let wait = bridge
            .config()
            .block_budget()
            .saturating_sub(Duration::from_millis(1));

        let (to_worker, worker_rx) = mpsc::sync_channel::<Block>(QUEUE_DEPTH);
        let (worker_tx, from_worker) = mpsc::sync_channel::<Result<Block>>(QUEUE_DEPTH);

        let worker = thread::Builder::new()
            .name("dtln-deferred".to_string())
            .spawn(move || run_worker(bridge, handle, worker_rx, worker_tx))?;

        Ok(Self {
            to_worker: Some(to_worker),
            from_worker,
            worker: Some(worker),
            first_block: true,
            in_flight: 0,
            wait,
        })
    }

    /// Submit `block` and collect the previous block's result.
    pub fn denoise(&mut self, block: &Block) -> Result<DenoiseResult> {
        let mut result = self.receive()?;

        let sender = self
            .to_worker
            .as_ref()
            .ok_or_else(|| BridgeError::ProcessorStopped("processor was stopped".to_string()))?;
        match sender.try_send(*block) {
            Ok(()) => self.in_flight += 1,
            Err(TrySendError::Full(_)) => result.processor_starved = true,
            Err(TrySendError::Disconnected(_)) => {
                return Err(BridgeError::ProcessorStopped(
                    "worker thread exited".to_string(),
                ))
            }
        }

        Ok(result)
    }

    fn receive(&mut self) -> Result<DenoiseResult> {
        if self.first_block {
            // Nothing has been submitted yet.
            self.first_block = false;
            return Ok(DenoiseResult::silence(false));
        }

        // Only the newest submission is current; older results are stale.
        let deadline = Instant::now() + self.wait;
        while self.in_flight > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let received = match self.from_worker.recv_timeout(remaining) {
                Ok(received) => received,
                Err(RecvTimeoutError::Timeout) => return Ok(DenoiseResult::silence(true)),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(BridgeError::ProcessorStopped(
                        "worker thread exited".to_string(),
                    ))
                }
            };
            self.in_flight -= 1;

            match received {
                Ok(samples) if self.in_flight == 0 => {
                    return Ok(DenoiseResult {
                        samples,
                        processor_starved: false,
                    })
                }
                Err(e) if self.in_flight == 0 => return Err(e),
                Ok(_) => {}
                Err(e) => tracing::warn!("discarding late block failure: {}", e),
            }
        }

        // The previous block was never submitted.
        Ok(DenoiseResult::silence(true))
    }

    /// Stop the worker, destroy the stream and hand the bridge back.
    pub fn stop(&mut self) -> Option<DenoiseBridge> {
        drop(self.to_worker.take());
        // Drain until the worker hangs up so it never blocks on a full queue.
        while self.from_worker.recv().is_ok() {}
        self.in_flight = 0;

        let worker = self.worker.take()?;
        match worker.join() {
            Ok(bridge) => Some(bridge),
            Err(_) => {
                tracing::warn!("deferred processor worker panicked");
                None
            }
        }
    }
}

impl Drop for DeferredProcessor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(
    mut bridge: DenoiseBridge,
    handle: Handle,
    input: Receiver<Block>,
    output: SyncSender<Result<Block>>,
) -> DenoiseBridge {
    let mut denoised = [0.0f32; BLOCK_SIZE];
    for block in input.iter() {
        let result = bridge
            .process(&handle, &block, &mut denoised)
            .map(|()| denoised);
        if output.send(result).is_err() {
            break;
        }
    }

    bridge.destroy(handle);
    bridge
}
