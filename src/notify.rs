//! Application-facing notification contracts: a small capability set each
//! application side implements so the engine can report product lifecycle
//! events without polling. The receiver notifier's `on_bop` hands back a
//! destination for the product's bytes; `None` preserves a "discard, but
//! still consume the datagram" mode.

/// A destination for a product's bytes, supplied by the receiving
/// application from `on_bop`.
pub trait ReceiveBuffer: Send {
    /// Writes `bytes` starting at byte offset `offset` within the
    /// product. Callers guarantee `offset + bytes.len() <= len()`.
    fn write_at(&mut self, offset: u32, bytes: &[u8]);

    /// Total capacity of the buffer, which always equals the product's
    /// `prodsize`.
    fn len(&self) -> u32;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A plain in-memory receive buffer, the common case for tests and small
/// products.
pub struct VecBuffer {
    bytes: Vec<u8>,
}

impl VecBuffer {
    pub fn new(prodsize: u32) -> VecBuffer {
        VecBuffer { bytes: vec![0u8; prodsize as usize] }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

impl ReceiveBuffer for VecBuffer {
    fn write_at(&mut self, offset: u32, bytes: &[u8]) {
        let start = offset as usize;
        self.bytes[start..start + bytes.len()].copy_from_slice(bytes);
    }

    fn len(&self) -> u32 {
        self.bytes.len() as u32
    }
}

/// Sending application notification contract: `on_eop` fires at most once
/// per product, when either all connected receivers acknowledge or the
/// retention deadline expires.
pub trait SenderNotifier: Send + Sync {
    fn on_eop(&self, prodindex: u32);
}

/// Receiving application notification contract.
pub trait ReceiverNotifier: Send + Sync {
    /// Called once a BOP has been parsed. Returns `Some(buffer)` to
    /// receive the product's bytes, or `None` to discard them (the
    /// datagram/frame stream is still fully consumed either way).
    fn on_bop(&self, prodsize: u32, metadata: &[u8]) -> Option<Box<dyn ReceiveBuffer>>;

    /// Called once when the product is fully received.
    fn on_eop(&self, prodindex: u32);

    /// Called once when the sender has rejected every outstanding
    /// retransmission request for a product (`RETX_REJ`), meaning it can
    /// no longer be recovered.
    fn on_missed_prod(&self, prodindex: u32);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vec_buffer_write_at_offsets() {
        let mut buf = VecBuffer::new(10);
        buf.write_at(0, &[1, 2, 3]);
        buf.write_at(7, &[9, 9, 9]);
        assert_eq!(buf.as_slice(), &[1, 2, 3, 0, 0, 0, 0, 9, 9, 9]);
    }
}
