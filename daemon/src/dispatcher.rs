use tracing::{debug, error, info};

use crate::color::{color_for, Color};
use crate::indicator::Indicator;
use crate::queue::NotificationReceiver;
use crate::state::DashcamState;

/// The service loop: waits for notifications and shows the latest one.
///
/// Only the most recent state of each drained batch reaches the indicator.
/// The light is a level, not an event log, so the states before it are
/// dropped without side effects.
pub struct Dispatcher<I: Indicator> {
    indicator: I,
    receiver: NotificationReceiver,
    current: Option<Color>,
}

impl<I: Indicator> Dispatcher<I> {
    pub fn new(indicator: I, receiver: NotificationReceiver) -> Self {
        Self {
            indicator,
            receiver,
            current: None,
        }
    }

    /// The color most recently applied by this dispatcher, if any.
    #[cfg(test)]
    pub fn current(&self) -> Option<Color> {
        self.current
    }

    /// Applies the last state of `batch`. Returns the color shown, or `None`
    /// when the batch is empty or the indicator write failed.
    pub fn dispatch_batch(&mut self, batch: &[DashcamState]) -> Option<Color> {
        let &latest = batch.last()?;
        if batch.len() > 1 {
            debug!(
                discarded = batch.len() - 1,
                "coalesced burst of notifications"
            );
        }

        let color = color_for(latest);
        if self.current == Some(color) {
            // Still rewritten: the lines may have been disturbed externally.
            debug!(state = %latest, %color, "color unchanged");
        } else {
            info!(state = %latest, %color, previous = ?self.current, "Setting status");
        }
        match self.indicator.set_color(color) {
            Ok(()) => {
                self.current = Some(color);
                Some(color)
            }
            Err(e) => {
                // Keep serving; the next notification rewrites all three lines.
                error!(error = %e, "failed to update indicator");
                None
            }
        }
    }

    /// Runs until the process is terminated.
    pub fn run(mut self) {
        loop {
            let batch = self.receiver.drain_all();
            self.dispatch_batch(&batch);
        }
    }
}
