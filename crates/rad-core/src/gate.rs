use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

/// Handler-scoped cap on concurrent active streams. `max == 0` means
/// unlimited.
#[derive(Clone)]
pub struct StreamGate {
    inner: Arc<GateInner>,
}

struct GateInner {
    max: usize,
    active: AtomicUsize,
}

impl StreamGate {
    pub fn new(max: usize) -> Self {
        Self {
            inner: Arc::new(GateInner {
                max,
                active: AtomicUsize::new(0),
            }),
        }
    }

    pub fn try_acquire(&self) -> Option<StreamPermit> {
        let inner = &self.inner;
        inner
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                (inner.max == 0 || active < inner.max).then_some(active + 1)
            })
            .ok()?;
        Some(StreamPermit {
            inner: Some(self.inner.clone()),
        })
    }

    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }
}

/// Holds one admission slot. Dropping releases it; [`StreamPermit::release_on_done`]
/// defers the release to the pipe's done signal so the counter tracks true
/// in-flight streams even on error paths.
pub struct StreamPermit {
    inner: Option<Arc<GateInner>>,
}

impl StreamPermit {
    pub fn release_on_done(mut self, mut done: watch::Receiver<bool>) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        tokio::spawn(async move {
            // An error means the pipe was dropped without closing; either
            // way the slot comes back.
            let _ = done.wait_for(|fired| *fired).await;
            drop(StreamPermit { inner: Some(inner) });
        });
    }
}

impl Drop for StreamPermit {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.active.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::pipe::StreamPipe;

    use super::*;

    #[test]
    fn zero_means_unlimited() {
        let gate = StreamGate::new(0);
        let permits: Vec<_> = (0..256).map(|_| gate.try_acquire().unwrap()).collect();
        assert_eq!(gate.active(), 256);
        drop(permits);
        assert_eq!(gate.active(), 0);
    }

    #[test]
    fn cap_is_enforced() {
        let gate = StreamGate::new(2);
        let first = gate.try_acquire().unwrap();
        let _second = gate.try_acquire().unwrap();
        assert!(gate.try_acquire().is_none());
        drop(first);
        assert!(gate.try_acquire().is_some());
    }

    #[tokio::test]
    async fn permit_releases_when_pipe_closes() {
        let gate = StreamGate::new(1);
        let (pipe, _errors) = StreamPipe::new(4);
        let permit = gate.try_acquire().unwrap();
        permit.release_on_done(pipe.done());
        assert_eq!(gate.active(), 1);

        pipe.close();
        // The release task needs a tick to observe the signal.
        tokio::time::timeout(Duration::from_secs(1), async {
            while gate.active() != 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(gate.try_acquire().is_some());
    }
}
