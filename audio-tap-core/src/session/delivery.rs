use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use crossbeam_channel::{bounded, Receiver, Sender};

use crate::models::audio_models::DeliveryStats;
use crate::processing::format_converter::FormatConverter;
use crate::traits::capture_backend::{IoProcHandler, RawAudioBuffers};

/// Consumer of converted audio. Receives raw PCM bytes in the target format.
///
/// Always invoked on the audio queue, never concurrently with itself.
pub type AudioDataCallback = Arc<dyn Fn(&[u8]) + Send + Sync + 'static>;

/// Generation value meaning "no session is delivering".
const INACTIVE: u64 = 0;

/// Converted buffer travelling from the IOProc to the audio queue.
pub struct AudioChunk {
    generation: u64,
    frames: usize,
    data: Vec<u8>,
}

impl AudioChunk {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

struct CallbackSlot(AudioDataCallback);

/// Generation one session's IOProc delivers under.
///
/// Inactive after setup. Every start stores a fresh value, so chunks
/// converted before a stop never match the restarted session.
#[derive(Debug, Default)]
pub struct SessionGeneration(AtomicU64);

impl SessionGeneration {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, generation: u64) {
        self.0.store(generation, Ordering::SeqCst);
    }
}

/// State shared by the real-time IOProc and the audio queue.
///
/// The IOProc side only touches atomics and bounded channels
/// (`try_recv`/`try_send`); the queue side owns delivery to the consumer.
/// Buffers come from a fixed pool and are recycled after delivery. The
/// queue side keeps them reserved for the largest converted buffer of the
/// current session, so the real-time path does not allocate for buffers
/// up to `max_frames_per_buffer` frames.
pub struct DeliveryState {
    active_generation: AtomicU64,
    next_generation: AtomicU64,
    buffer_bytes: AtomicUsize,
    callback: ArcSwapOption<CallbackSlot>,
    data_tx: Sender<AudioChunk>,
    free_tx: Sender<Vec<u8>>,
    free_rx: Receiver<Vec<u8>>,

    callback_count: AtomicU64,
    delivered: AtomicU64,
    dropped_conversion: AtomicU64,
    dropped_overrun: AtomicU64,
    discarded_stale: AtomicU64,
}

impl DeliveryState {
    /// Create the shared state with `pool_size` buffers of `buffer_bytes`
    /// capacity. Returns the receiving end the audio queue drains.
    pub fn new(pool_size: usize, buffer_bytes: usize) -> (Arc<Self>, Receiver<AudioChunk>) {
        let pool_size = pool_size.max(1);
        let (data_tx, data_rx) = bounded(pool_size);
        let (free_tx, free_rx) = bounded(pool_size);
        for _ in 0..pool_size {
            let _ = free_tx.try_send(Vec::with_capacity(buffer_bytes));
        }

        let state = Arc::new(Self {
            active_generation: AtomicU64::new(INACTIVE),
            next_generation: AtomicU64::new(INACTIVE),
            buffer_bytes: AtomicUsize::new(buffer_bytes),
            callback: ArcSwapOption::empty(),
            data_tx,
            free_tx,
            free_rx,
            callback_count: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped_conversion: AtomicU64::new(0),
            dropped_overrun: AtomicU64::new(0),
            discarded_stale: AtomicU64::new(0),
        });
        (state, data_rx)
    }

    /// Allocate a generation for a new session. Never returns `INACTIVE`.
    pub fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn activate(&self, generation: u64) {
        self.active_generation.store(generation, Ordering::SeqCst);
    }

    /// Stop delivery for whatever session is active. Buffers already in
    /// flight are discarded when they reach the queue.
    pub fn deactivate(&self) {
        self.active_generation.store(INACTIVE, Ordering::SeqCst);
    }

    pub fn is_active(&self, generation: u64) -> bool {
        generation != INACTIVE && self.active_generation.load(Ordering::SeqCst) == generation
    }

    pub fn set_callback(&self, callback: Option<AudioDataCallback>) {
        self.callback.store(callback.map(|cb| Arc::new(CallbackSlot(cb))));
    }

    pub fn has_callback(&self) -> bool {
        self.callback.load().is_some()
    }

    /// Queue side: hand `chunk` to the consumer if its session is still
    /// the active one, then recycle the buffer.
    pub fn deliver(&self, chunk: AudioChunk) {
        let AudioChunk { generation, data, .. } = chunk;
        if self.is_active(generation) {
            if let Some(slot) = self.callback.load_full() {
                (slot.0)(&data);
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
        } else {
            self.discarded_stale.fetch_add(1, Ordering::Relaxed);
        }
        self.recycle(self.reserved(data));
    }

    /// Grow pooled buffers to hold `bytes`. Queue side only; buffers in
    /// flight are grown when they come back through `deliver`.
    pub fn reserve_buffers(&self, bytes: usize) {
        if self.buffer_bytes.fetch_max(bytes, Ordering::SeqCst) >= bytes {
            return;
        }
        let idle: Vec<Vec<u8>> = self.free_rx.try_iter().collect();
        for buffer in idle {
            self.recycle(self.reserved(buffer));
        }
    }

    pub fn buffer_bytes(&self) -> usize {
        self.buffer_bytes.load(Ordering::SeqCst)
    }

    fn reserved(&self, mut buffer: Vec<u8>) -> Vec<u8> {
        buffer.clear();
        let bytes = self.buffer_bytes.load(Ordering::SeqCst);
        buffer.reserve(bytes);
        buffer
    }

    fn recycle(&self, mut buffer: Vec<u8>) {
        buffer.clear();
        let _ = self.free_tx.try_send(buffer);
    }

    /// Build the real-time IOProc of one session.
    ///
    /// The handler delivers under whatever `generation` holds when it runs
    /// and resets the converter's stream history whenever that changes.
    pub fn io_proc_handler(
        self: &Arc<Self>,
        generation: Arc<SessionGeneration>,
        mut converter: FormatConverter,
    ) -> IoProcHandler {
        let state = Arc::clone(self);
        let mut last_generation = INACTIVE;
        Box::new(move |input: &RawAudioBuffers<'_>| {
            state.callback_count.fetch_add(1, Ordering::Relaxed);
            let generation = generation.get();
            if !state.is_active(generation) {
                return;
            }
            if generation != last_generation {
                converter.reset();
                last_generation = generation;
            }

            let Ok(mut buffer) = state.free_rx.try_recv() else {
                state.dropped_overrun.fetch_add(1, Ordering::Relaxed);
                return;
            };

            match converter.convert(input, &mut buffer) {
                Ok(0) => state.recycle(buffer),
                Ok(frames) => {
                    let chunk = AudioChunk {
                        generation,
                        frames,
                        data: buffer,
                    };
                    if let Err(err) = state.data_tx.try_send(chunk) {
                        state.dropped_overrun.fetch_add(1, Ordering::Relaxed);
                        state.recycle(err.into_inner().data);
                    }
                }
                Err(_) => {
                    state.dropped_conversion.fetch_add(1, Ordering::Relaxed);
                    state.recycle(buffer);
                }
            }
        })
    }

    pub fn stats(&self) -> DeliveryStats {
        DeliveryStats {
            callback_count: self.callback_count.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped_conversion: self.dropped_conversion.load(Ordering::Relaxed),
            dropped_overrun: self.dropped_overrun.load(Ordering::Relaxed),
            discarded_stale: self.discarded_stale.load(Ordering::Relaxed),
        }
    }
}
