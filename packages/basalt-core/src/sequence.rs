//! Closeable lazy sequence.
//!
//! Query results stream between crates as `Sequence<T>`: an iterator of
//! `Result<T>` carrying close hooks that release borrowed cursors and other
//! scoped resources on every exit path, including drop during cancellation.

use crate::error::Result;

type CloseHook = Box<dyn FnOnce() + Send>;

pub struct Sequence<T> {
    iter: Box<dyn Iterator<Item = Result<T>> + Send>,
    close_hooks: Vec<CloseHook>,
    closed: bool,
}

impl<T> std::fmt::Debug for Sequence<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sequence")
            .field("close_hooks", &self.close_hooks.len())
            .field("closed", &self.closed)
            .finish()
    }
}

impl<T: Send + 'static> Sequence<T> {
    pub fn new(iter: impl Iterator<Item = Result<T>> + Send + 'static) -> Sequence<T> {
        Sequence {
            iter: Box::new(iter),
            close_hooks: Vec::new(),
            closed: false,
        }
    }

    pub fn empty() -> Sequence<T> {
        Sequence::new(std::iter::empty())
    }

    pub fn from_vec(items: Vec<T>) -> Sequence<T> {
        Sequence::new(items.into_iter().map(Ok))
    }

    /// Single-element sequence carrying an error; used to defer failures to
    /// consumption time so close hooks still run.
    pub fn error(err: crate::BasaltError) -> Sequence<T> {
        Sequence::new(std::iter::once(Err(err)))
    }

    /// Register a hook invoked exactly once on close (or drop).
    pub fn on_close(mut self, hook: impl FnOnce() + Send + 'static) -> Sequence<T> {
        self.close_hooks.push(Box::new(hook));
        self
    }

    /// Transform items; the source sequence stays owned by the result, so its
    /// close hooks still run when the mapped sequence is dropped.
    pub fn map<U: Send + 'static>(
        self,
        mut f: impl FnMut(T) -> Result<U> + Send + 'static,
    ) -> Sequence<U> {
        Sequence::new(Iterator::map(self, move |item| item.and_then(|v| f(v))))
    }

    /// Concatenate sequences, closing each as it drains.
    pub fn concat(parts: Vec<Sequence<T>>) -> Sequence<T> {
        Sequence::new(parts.into_iter().flatten())
    }

    /// Drain into a vec, closing the sequence. Errors short-circuit but the
    /// close hooks still run via drop.
    pub fn to_vec(mut self) -> Result<Vec<T>> {
        let mut out = Vec::new();
        for item in &mut self.iter {
            out.push(item?);
        }
        self.close();
        Ok(out)
    }

    /// Idempotent; runs the registered hooks in reverse registration order.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        while let Some(hook) = self.close_hooks.pop() {
            hook();
        }
    }
}

impl<T> Iterator for Sequence<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.closed {
            return None;
        }
        self.iter.next()
    }
}

impl<T> Drop for Sequence<T> {
    fn drop(&mut self) {
        self.closed = true;
        while let Some(hook) = self.close_hooks.pop() {
            hook();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_close_hook_runs_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let mut seq = Sequence::from_vec(vec![1, 2, 3]).on_close(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(seq.next().unwrap().unwrap(), 1);
        seq.close();
        seq.close();
        drop(seq);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_hooks_run_on_drop_mid_stream() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        {
            let mut seq = Sequence::from_vec(vec![1, 2, 3]).on_close(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
            let _ = seq.next();
            // dropped with items remaining
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_error_surfaces_in_stream() {
        let seq: Sequence<i64> = Sequence::error(crate::BasaltError::Cancelled("closed".into()));
        assert!(matches!(
            seq.to_vec(),
            Err(crate::BasaltError::Cancelled(_))
        ));
    }
}
