//! Shared, wipeable storage for a single piece of secret material.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use zeroize::{Zeroize, Zeroizing};

/// Error produced when secret material is used after erasure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SecretError {
    #[error("secret material was already wiped")]
    Wiped,
}

struct CellState {
    bytes: Zeroizing<Vec<u8>>,
    wiped: bool,
}

/// A cheaply-cloneable handle to secret bytes.
///
/// The signing pool holds one clone while a task is in flight and wipes the
/// contents once the task settles, whatever the outcome; the caller's clone
/// observes the erasure because the storage is shared. Remaining clones drop
/// an already-zeroized buffer.
#[derive(Clone)]
pub struct SecretCell {
    inner: Arc<Mutex<CellState>>,
}

impl SecretCell {
    /// Take ownership of credential bytes. The caller should not retain
    /// another copy of `bytes`.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CellState {
                bytes: Zeroizing::new(bytes),
                wiped: false,
            })),
        }
    }

    /// Take ownership of a passphrase or similar textual credential.
    pub fn from_string(value: String) -> Self {
        Self::from_bytes(value.into_bytes())
    }

    /// Run `f` over the secret bytes without copying them out.
    pub fn expose<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R, SecretError> {
        let state = self.lock();
        if state.wiped {
            return Err(SecretError::Wiped);
        }
        Ok(f(&state.bytes))
    }

    /// Zero-fill the stored bytes in place.
    ///
    /// The length is preserved so callers can verify the contents are gone;
    /// any later `expose` fails with [`SecretError::Wiped`]. Wiping twice is
    /// a no-op.
    pub fn wipe(&self) {
        let mut state = self.lock();
        state.bytes.as_mut_slice().zeroize();
        state.wiped = true;
    }

    pub fn is_wiped(&self) -> bool {
        self.lock().wiped
    }

    pub fn len(&self) -> usize {
        self.lock().bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CellState> {
        // A panic inside `expose` must not make the bytes unreachable, the
        // wipe path still has to run.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for SecretCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("SecretCell")
            .field("len", &state.bytes.len())
            .field("wiped", &state.wiped)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expose_reads_the_bytes() {
        let cell = SecretCell::from_bytes(vec![1, 2, 3]);
        let sum = cell.expose(|b| b.iter().map(|x| *x as u32).sum::<u32>()).unwrap();
        assert_eq!(sum, 6);
    }

    #[test]
    fn wipe_zeroes_in_place_and_blocks_expose() {
        let cell = SecretCell::from_bytes(vec![0xFF; 16]);
        cell.wipe();

        assert!(cell.is_wiped());
        assert_eq!(cell.len(), 16);
        assert_eq!(cell.expose(|_| ()), Err(SecretError::Wiped));

        let state = cell.inner.lock().unwrap();
        assert!(state.bytes.iter().all(|b| *b == 0));
    }

    #[test]
    fn clones_share_the_same_storage() {
        let caller = SecretCell::from_string("cert-passphrase".into());
        let pool_copy = caller.clone();

        pool_copy.wipe();

        assert!(caller.is_wiped());
        assert_eq!(caller.expose(|_| ()), Err(SecretError::Wiped));
    }

    #[test]
    fn debug_never_prints_contents() {
        let cell = SecretCell::from_bytes(b"hunter2".to_vec());
        let rendered = format!("{cell:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("len"));
    }

    #[test]
    fn panic_while_exposed_does_not_block_wipe() {
        let cell = SecretCell::from_bytes(vec![9; 8]);
        let probe = cell.clone();
        let result = std::panic::catch_unwind(move || {
            probe.expose(|_| panic!("signer blew up")).ok();
        });
        assert!(result.is_err());

        cell.wipe();
        assert!(cell.is_wiped());
    }
}
