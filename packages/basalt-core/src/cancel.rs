//! Cooperative cancellation flag shared between a query and its cursors.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cloneable cancellation handle. Cursors poll it on every advance; the
/// broker flips it on caller close, timeout, or upstream error.
#[derive(Debug, Clone, Default)]
pub struct QueryCancel {
    flag: Arc<AtomicBool>,
}

impl QueryCancel {
    pub fn new() -> QueryCancel {
        QueryCancel::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Raise `Cancelled` if the flag is set; scan loops call this at every
    /// suspension point.
    pub fn check(&self) -> crate::Result<()> {
        if self.is_cancelled() {
            Err(crate::BasaltError::Cancelled("query cancelled".into()))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_propagates_to_clones() {
        let a = QueryCancel::new();
        let b = a.clone();
        assert!(a.check().is_ok());
        b.cancel();
        assert!(a.check().is_err());
    }
}
