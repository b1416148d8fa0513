use std::error::Error;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::Chain;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, error, info};

/// Consumer of progress events and user-facing error reports.
pub trait ProgressSink {
    /// A long-running read began; `total` is the expected byte count if known.
    fn start(&self, message: &str, total: Option<u64>);
    fn advance(&self, bytes: u64);
    fn finish(&self);
    /// Show an error to the user with its category and full cause chain.
    fn report_error(&self, category: &str, context: &str, error: &(dyn Error + 'static));
}

/// `error` and its causes, in the same shape as anyhow's `{:#}`.
pub fn render(error: &(dyn Error + 'static)) -> String {
    Chain::new(error).map(|cause| cause.to_string()).collect::<Vec<_>>().join(": ")
}

/// Non-interactive sink: everything goes to the log.
#[derive(Debug, Default)]
pub struct ConsoleSink {
    bytes: AtomicU64,
}

impl ConsoleSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressSink for ConsoleSink {
    fn start(&self, message: &str, total: Option<u64>) {
        self.bytes.store(0, Ordering::Relaxed);
        match total {
            Some(total) => info!(total_bytes = total, "{message}"),
            None => info!("{message}"),
        }
    }

    fn advance(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn finish(&self) {
        debug!(bytes = self.bytes.load(Ordering::Relaxed), "transfer finished");
    }

    fn report_error(&self, category: &str, context: &str, error: &(dyn Error + 'static)) {
        error!(category, "{context} {}", render(error));
    }
}

/// Interactive sink: a terminal progress bar that the user can abort with Ctrl+C.
#[derive(Default)]
pub struct InteractiveSink {
    bar: Mutex<Option<ProgressBar>>,
}

impl InteractiveSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn style(total_known: bool) -> ProgressStyle {
        let template = if total_known {
            "{spinner} {msg} [{bar:30}] {bytes}/{total_bytes} (Ctrl+C to cancel)"
        } else {
            "{spinner} {msg} {bytes} (Ctrl+C to cancel)"
        };
        ProgressStyle::with_template(template)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ")
    }
}

impl ProgressSink for InteractiveSink {
    fn start(&self, message: &str, total: Option<u64>) {
        let bar = match total {
            Some(total) => ProgressBar::new(total),
            None => ProgressBar::new_spinner(),
        };
        bar.set_style(Self::style(total.is_some()));
        bar.set_message(message.to_string());
        if let Ok(mut slot) = self.bar.lock() {
            if let Some(previous) = slot.replace(bar) {
                previous.finish_and_clear();
            }
        }
    }

    fn advance(&self, bytes: u64) {
        if let Ok(slot) = self.bar.lock() {
            if let Some(bar) = slot.as_ref() {
                bar.inc(bytes);
            }
        }
    }

    fn finish(&self) {
        if let Ok(mut slot) = self.bar.lock() {
            if let Some(bar) = slot.take() {
                bar.finish_and_clear();
            }
        }
    }

    fn report_error(&self, category: &str, context: &str, error: &(dyn Error + 'static)) {
        let message = format!("packwiz-installer-bootstrap: {context}\n{category}: {}", render(error));
        match self.bar.lock().ok().and_then(|slot| slot.clone()) {
            Some(bar) => bar.suspend(|| eprintln!("{message}")),
            None => eprintln!("{message}"),
        }
    }
}
