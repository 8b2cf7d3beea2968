use std::sync::{Mutex, MutexGuard, PoisonError};

use tally_core::TracedOp;

pub(crate) type TraceSlot = Mutex<Option<Vec<TracedOp>>>;

pub(crate) fn lock(slot: &TraceSlot) -> MutexGuard<'_, Option<Vec<TracedOp>>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Installs a fresh recording and puts the previous one back when finished
/// or dropped. Operations captured here are also appended to an enclosing
/// recording.
pub(crate) struct TraceGuard<'a> {
    slot: &'a TraceSlot,
    previous: Option<Option<Vec<TracedOp>>>,
}

impl<'a> TraceGuard<'a> {
    pub(crate) fn install(slot: &'a TraceSlot) -> Self {
        let previous = lock(slot).replace(Vec::new());
        Self {
            slot,
            previous: Some(previous),
        }
    }

    pub(crate) fn finish(mut self) -> Vec<TracedOp> {
        self.restore()
    }

    fn restore(&mut self) -> Vec<TracedOp> {
        let Some(previous) = self.previous.take() else {
            return Vec::new();
        };
        let mut slot = lock(self.slot);
        let captured = slot.take().unwrap_or_default();
        *slot = previous.map(|mut outer| {
            outer.extend(captured.iter().cloned());
            outer
        });
        captured
    }
}

impl Drop for TraceGuard<'_> {
    fn drop(&mut self) {
        self.restore();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::{lock, TraceGuard};
    use tally_core::{OperationKind, TracedOp};

    fn op(sql: &str) -> TracedOp {
        TracedOp {
            kind: OperationKind::Query,
            sql: sql.to_string(),
            params: Vec::new(),
        }
    }

    #[test]
    fn nested_traces_feed_the_outer_one() {
        let slot = Mutex::new(None);
        let outer = TraceGuard::install(&slot);
        lock(&slot).as_mut().expect("outer active").push(op("a"));
        let inner = TraceGuard::install(&slot);
        lock(&slot).as_mut().expect("inner active").push(op("b"));
        let captured = inner.finish();
        assert_eq!(captured, vec![op("b")]);
        let captured = outer.finish();
        assert_eq!(captured, vec![op("a"), op("b")]);
        assert!(lock(&slot).is_none());
    }

    #[test]
    fn dropping_restores_previous_state() {
        let slot = Mutex::new(None);
        {
            let _guard = TraceGuard::install(&slot);
            assert!(lock(&slot).is_some());
        }
        assert!(lock(&slot).is_none());
    }
}
