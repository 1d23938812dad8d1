//! Progress reporting from the byte-transform loop.

use tokio::sync::mpsc;

use cryptfile_common::Progress;

/// Non-blocking, monotonic progress sink.
///
/// Updates that would move backwards are dropped, and so is everything
/// after the receiver has gone away.
#[derive(Debug, Default)]
pub struct ProgressReporter {
    sender: Option<mpsc::UnboundedSender<Progress>>,
    last: Option<Progress>,
}

impl ProgressReporter {
    pub fn new(sender: mpsc::UnboundedSender<Progress>) -> Self {
        Self {
            sender: Some(sender),
            last: None,
        }
    }

    /// A reporter that discards every update.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Report `processed` of `total` bytes.
    pub fn report(&mut self, processed: u64, total: u64) {
        let progress = Progress::new(processed, total);
        if let Some(last) = self.last {
            if progress.processed < last.processed {
                return;
            }
        }
        self.last = Some(progress);

        if let Some(sender) = &self.sender {
            if sender.send(progress).is_err() {
                self.sender = None;
            }
        }
    }

    /// Most recent value reported.
    pub fn last(&self) -> Option<Progress> {
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reports_are_monotonic() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut reporter = ProgressReporter::new(tx);

        reporter.report(10, 100);
        reporter.report(5, 100);
        reporter.report(100, 100);

        assert_eq!(rx.try_recv().unwrap(), Progress::new(10, 100));
        assert_eq!(rx.try_recv().unwrap(), Progress::new(100, 100));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_receiver_is_ignored() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);

        let mut reporter = ProgressReporter::new(tx);
        reporter.report(1, 2);
        reporter.report(2, 2);
        assert_eq!(reporter.last(), Some(Progress::new(2, 2)));
    }
}
