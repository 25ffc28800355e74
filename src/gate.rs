//! Callback slot that can be shut.
//!
//! Connection and poll tasks deliver through a gate. `shut` takes the same
//! lock as `deliver`, so once `shut` returns no callback is running and none
//! will run again.

use std::sync::{Arc, Mutex, MutexGuard};

pub type Callback<E> = Arc<dyn Fn(E) + Send + Sync>;

pub struct CallbackGate<E> {
    slot: Arc<Mutex<Option<Callback<E>>>>,
}

impl<E> Clone for CallbackGate<E> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<E> CallbackGate<E> {
    pub fn new(callback: Callback<E>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(callback))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Callback<E>>> {
        match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Invokes the callback unless the gate is shut. Returns whether it ran.
    pub fn deliver(&self, event: E) -> bool {
        let guard = self.lock();
        match guard.as_ref() {
            Some(callback) => {
                callback(event);
                true
            }
            None => false,
        }
    }

    /// Idempotent.
    pub fn shut(&self) {
        self.lock().take();
    }

    pub fn is_shut(&self) -> bool {
        self.lock().is_none()
    }
}
