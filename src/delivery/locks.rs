//! Per-invoice in-flight guard.
//!
//! At most one delivery attempt per invoice number runs at a time within a
//! process. A second attempt does not wait; it is refused immediately.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::warn;

/// Set of invoice numbers with a delivery attempt in flight.
#[derive(Debug, Clone, Default)]
pub struct InvoiceLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

impl InvoiceLocks {
    /// Create an empty lock set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `number`, or return `None` if an attempt already holds it.
    pub fn try_acquire(&self, number: &str) -> Option<InvoiceLockGuard> {
        let mut held = match self.held.lock() {
            Ok(held) => held,
            Err(poisoned) => {
                warn!("invoice lock set poisoned, recovering");
                poisoned.into_inner()
            }
        };
        if !held.insert(number.to_owned()) {
            return None;
        }
        Some(InvoiceLockGuard {
            held: Arc::clone(&self.held),
            number: number.to_owned(),
        })
    }

    /// Whether an attempt currently holds `number`.
    pub fn is_held(&self, number: &str) -> bool {
        self.held
            .lock()
            .map(|held| held.contains(number))
            .unwrap_or(false)
    }
}

/// Releases its invoice number when dropped.
#[derive(Debug)]
pub struct InvoiceLockGuard {
    held: Arc<Mutex<HashSet<String>>>,
    number: String,
}

impl Drop for InvoiceLockGuard {
    fn drop(&mut self) {
        match self.held.lock() {
            Ok(mut held) => {
                held.remove(&self.number);
            }
            Err(poisoned) => {
                poisoned.into_inner().remove(&self.number);
            }
        }
    }
}
