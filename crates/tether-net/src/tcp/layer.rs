//! The read-layer binding.
//!
//! An upper protocol layer can push bytes it already holds through a
//! connection's read path without owning the socket. [`ReadLayer`] binds such a
//! foreign buffer as the connection's read source for one synchronous drain.
//! Only one binding may be live per connection.
//!
//! The bound bytes and the read cursor live in the connection's gate, so code
//! that holds only the connection can pull from the active source through
//! `did_read_layer` while the guard is alive.

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::{NetworkError, Result};

#[derive(Debug)]
struct Binding {
    data: Bytes,
    offset: usize,
}

impl Binding {
    fn read(&mut self, out: &mut [u8]) -> usize {
        let remaining = &self.data[self.offset..];
        let n = remaining.len().min(out.len());
        out[..n].copy_from_slice(&remaining[..n]);
        self.offset += n;
        n
    }
}

/// Holds the one live [`ReadLayer`] binding of a connection.
#[derive(Debug, Default)]
pub(crate) struct ReadLayerGate {
    bound: Mutex<Option<Binding>>,
}

impl ReadLayerGate {
    pub(crate) fn bind(&self, data: &[u8]) -> Result<ReadLayer<'_>> {
        let mut bound = self.bound.lock();
        if bound.is_some() {
            return Err(NetworkError::ReadLayerBusy);
        }
        *bound = Some(Binding {
            data: Bytes::copy_from_slice(data),
            offset: 0,
        });
        Ok(ReadLayer { gate: self })
    }

    /// Read from the live binding. `None` when nothing is bound.
    pub(crate) fn read_bound(&self, out: &mut [u8]) -> Option<usize> {
        self.bound.lock().as_mut().map(|binding| binding.read(out))
    }

    fn with_binding(&self, f: impl FnOnce(&mut Binding) -> usize) -> usize {
        self.bound.lock().as_mut().map_or(0, f)
    }

    #[cfg(test)]
    pub(crate) fn is_bound(&self) -> bool {
        self.bound.lock().is_some()
    }
}

/// A foreign buffer bound as a connection's read source.
///
/// Dropping the value releases the binding.
#[derive(Debug)]
pub struct ReadLayer<'a> {
    gate: &'a ReadLayerGate,
}

impl ReadLayer<'_> {
    /// Copy up to `out.len()` bytes and advance past them.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        self.gate.with_binding(|binding| binding.read(out))
    }

    /// Bytes read so far, through the guard or the connection.
    pub fn consumed(&self) -> usize {
        self.gate.with_binding(|binding| binding.offset)
    }

    /// Bytes still available.
    pub fn remaining(&self) -> usize {
        self.gate.with_binding(|binding| binding.data.len() - binding.offset)
    }
}

impl Drop for ReadLayer<'_> {
    fn drop(&mut self) {
        self.gate.bound.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_advances() {
        let gate = ReadLayerGate::default();
        let mut layer = gate.bind(b"hello world").unwrap();

        let mut out = [0u8; 5];
        assert_eq!(layer.read(&mut out), 5);
        assert_eq!(&out, b"hello");
        assert_eq!(layer.consumed(), 5);

        let mut rest = [0u8; 32];
        assert_eq!(layer.read(&mut rest), 6);
        assert_eq!(&rest[..6], b" world");
        assert_eq!(layer.remaining(), 0);
        assert_eq!(layer.read(&mut rest), 0);
    }

    #[test]
    fn test_second_binding_is_rejected_until_release() {
        let gate = ReadLayerGate::default();
        let first = gate.bind(b"a").unwrap();
        assert_eq!(gate.bind(b"b").unwrap_err(), NetworkError::ReadLayerBusy);
        assert!(gate.is_bound());

        drop(first);
        assert!(!gate.is_bound());
        assert!(gate.bind(b"b").is_ok());
    }

    #[test]
    fn test_gate_reads_share_the_guard_cursor() {
        let gate = ReadLayerGate::default();
        let mut out = [0u8; 4];
        assert_eq!(gate.read_bound(&mut out), None);

        let mut layer = gate.bind(b"abcdef").unwrap();
        assert_eq!(gate.read_bound(&mut out), Some(4));
        assert_eq!(&out, b"abcd");
        assert_eq!(layer.consumed(), 4);

        assert_eq!(layer.read(&mut out), 2);
        assert_eq!(&out[..2], b"ef");
        assert_eq!(gate.read_bound(&mut out), Some(0));

        drop(layer);
        assert_eq!(gate.read_bound(&mut out), None);
    }
}
