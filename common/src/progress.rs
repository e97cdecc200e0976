//! Progress reporting for transfers.
//!
//! The transfer engine reports through [`ProgressSink`]. Each concurrent transfer gets its own
//! [`TransferProgress`]; when bars are enabled they share one [`ProgressBoard`].

/// Receives byte counts as content is copied.
pub trait ProgressSink: Send + Sync {
    /// `delta` more bytes of the entry `name` were copied.
    fn advance(&self, name: &str, delta: u64);

    /// The entry `name` was copied completely.
    fn finalize(&self, _name: &str) {}
}

/// Sink that ignores all updates.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn advance(&self, _name: &str, _delta: u64) {}
}

/// Progress of one transfer: cumulative byte and entry counters plus an optional bar.
pub struct TransferProgress {
    label: String,
    bytes: std::sync::atomic::AtomicU64,
    entries: std::sync::atomic::AtomicU64,
    bar: Option<indicatif::ProgressBar>,
}

impl TransferProgress {
    /// Counts bytes without displaying anything.
    pub fn counting(label: &str) -> Self {
        Self {
            label: label.to_string(),
            bytes: std::sync::atomic::AtomicU64::new(0),
            entries: std::sync::atomic::AtomicU64::new(0),
            bar: None,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Total bytes reported so far; never decreases.
    pub fn bytes(&self) -> u64 {
        self.bytes.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Number of entries reported as finalized.
    pub fn entries(&self) -> u64 {
        self.entries.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Marks the whole transfer as done.
    pub fn finish(&self, ok: bool) {
        if let Some(bar) = &self.bar {
            let status = if ok { "done" } else { "failed" };
            bar.finish_with_message(format!(
                "{status}: {} in {} entries",
                bytesize::ByteSize(self.bytes()),
                self.entries()
            ));
        }
    }
}

impl ProgressSink for TransferProgress {
    fn advance(&self, name: &str, delta: u64) {
        self.bytes
            .fetch_add(delta, std::sync::atomic::Ordering::Relaxed);
        if let Some(bar) = &self.bar {
            bar.inc(delta);
            bar.set_message(name.to_string());
        }
    }

    fn finalize(&self, name: &str) {
        self.entries
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        tracing::trace!("{}: finished {}", &self.label, name);
    }
}

/// Shared display for all transfer bars of one run.
pub struct ProgressBoard {
    multi: Option<indicatif::MultiProgress>,
    style: indicatif::ProgressStyle,
    tick: std::time::Duration,
}

const BAR_TEMPLATE: &str = "{spinner:.green} {prefix:.bold} {bytes} ({binary_bytes_per_sec}) {wide_msg}";

impl ProgressBoard {
    /// Board that creates counting-only transfers.
    pub fn hidden() -> Self {
        Self {
            multi: None,
            style: indicatif::ProgressStyle::default_spinner(),
            tick: std::time::Duration::from_millis(200),
        }
    }

    /// Board drawing one bar per transfer on stderr, refreshed every `tick`.
    pub fn new(tick: std::time::Duration) -> anyhow::Result<Self> {
        let style = indicatif::ProgressStyle::with_template(BAR_TEMPLATE)?;
        Ok(Self {
            multi: Some(indicatif::MultiProgress::with_draw_target(
                indicatif::ProgressDrawTarget::stderr(),
            )),
            style,
            tick,
        })
    }

    pub fn transfer(&self, label: &str) -> std::sync::Arc<TransferProgress> {
        let mut progress = TransferProgress::counting(label);
        if let Some(multi) = &self.multi {
            let bar = multi.add(indicatif::ProgressBar::new_spinner());
            bar.set_style(self.style.clone());
            bar.set_prefix(label.to_string());
            bar.enable_steady_tick(self.tick);
            progress.bar = Some(bar);
        }
        std::sync::Arc::new(progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let progress = TransferProgress::counting("a -> b");
        progress.advance("x", 10);
        progress.advance("x", 0);
        progress.advance("y", 5);
        progress.finalize("x");
        assert_eq!(progress.bytes(), 15);
        assert_eq!(progress.entries(), 1);
        assert_eq!(progress.label(), "a -> b");
    }

    #[test]
    fn counters_are_monotonic_across_threads() {
        let progress = std::sync::Arc::new(TransferProgress::counting("t"));
        let handles = (0..4)
            .map(|_| {
                let progress = progress.clone();
                std::thread::spawn(move || {
                    let mut last = 0;
                    for _ in 0..1000 {
                        progress.advance("f", 3);
                        let now = progress.bytes();
                        assert!(now >= last);
                        last = now;
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(progress.bytes(), 12_000);
    }

    #[test]
    fn hidden_board_transfers_still_count() {
        let board = ProgressBoard::hidden();
        let progress = board.transfer("pair");
        progress.advance("f", 7);
        progress.finish(true);
        assert_eq!(progress.bytes(), 7);
    }

    #[test]
    fn bar_template_is_valid() -> anyhow::Result<()> {
        let board = ProgressBoard::new(std::time::Duration::from_millis(100))?;
        let progress = board.transfer("pair");
        progress.advance("f", 1);
        progress.finish(false);
        Ok(())
    }
}
