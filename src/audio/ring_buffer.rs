//! Lock-free SPSC ring buffer for audio samples.
//!
//! Uses the `ringbuf` crate to move f32 samples from cpal callback threads
//! into the graph render task, and from the mix bus into the recorder,
//! without locks on the producer side.

use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapRb,
};

/// Default capacity: ~1 second of 48 kHz mono audio.
pub const DEFAULT_CAPACITY: usize = 48_000;

/// Producer half: lives in the cpal audio callback or the render task.
pub struct AudioProducer {
    inner: ringbuf::HeapProd<f32>,
}

/// Consumer half: lives behind an `AudioFeed`.
pub struct AudioConsumer {
    inner: ringbuf::HeapCons<f32>,
}

/// Create a matched producer/consumer pair backed by a lock-free ring buffer.
pub fn audio_ring_buffer(capacity: Option<usize>) -> (AudioProducer, AudioConsumer) {
    let cap = capacity.unwrap_or(DEFAULT_CAPACITY);
    let rb = HeapRb::<f32>::new(cap);
    let (prod, cons) = rb.split();
    (AudioProducer { inner: prod }, AudioConsumer { inner: cons })
}

impl AudioProducer {
    /// Push a slice of samples into the ring buffer.
    /// Returns the number of samples actually written (may be less than
    /// `samples.len()` if the buffer is full).
    pub fn push_slice(&mut self, samples: &[f32]) -> usize {
        self.inner.push_slice(samples)
    }
}

impl AudioConsumer {
    /// Pop up to `buf.len()` samples from the ring buffer into `buf`.
    /// Returns the number of samples actually read.
    pub fn pop_slice(&mut self, buf: &mut [f32]) -> usize {
        self.inner.pop_slice(buf)
    }

    /// Number of samples currently available for reading.
    pub fn available(&self) -> usize {
        self.inner.occupied_len()
    }

    /// Append all available samples to `out`. Returns how many were read.
    pub fn drain_into(&mut self, out: &mut Vec<f32>) -> usize {
        let n = self.available();
        if n == 0 {
            return 0;
        }
        let start = out.len();
        out.resize(start + n, 0.0);
        let read = self.pop_slice(&mut out[start..]);
        out.truncate(start + read);
        read
    }

    /// Discard everything currently buffered.
    pub fn clear(&mut self) -> usize {
        self.inner.skip(self.available())
    }
}
