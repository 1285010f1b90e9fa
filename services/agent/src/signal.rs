// Edge-triggered "configuration changed" signal between the request
// processor and a downstream proxy loader.
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// A single-consumer edge trigger. The processor raises it after every
/// committed batch; the consumer observes the edge exactly once per
/// `take`/`changed` and reloads configuration from the store's read view.
///
/// Edge semantics are swap-based, so a second concurrent consumer would
/// steal edges; give each loader its own signal instance instead.
#[derive(Debug, Default)]
pub struct ChangeSignal {
    raised: AtomicBool,
    notify: Notify,
}

impl ChangeSignal {
    /// Records that committed configuration changed and wakes any waiter.
    pub fn raise(&self) {
        self.raised.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Consumes the pending edge, if any.
    pub fn take(&self) -> bool {
        self.raised.swap(false, Ordering::AcqRel)
    }

    /// Waits for an edge and consumes it.
    pub async fn changed(&self) {
        loop {
            // Register interest before checking the flag so a raise between
            // the check and the await cannot be lost.
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();
            if self.take() {
                return;
            }
            notified.await;
        }
    }
}
