//! Terminal progress display fed from build events.

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::events::{BuildEvent, EventBus};

const TICKS: u64 = 1000;

/// A progress bar that follows the build's progress events.
pub struct ProgressDisplay {
    bar: ProgressBar,
    task: JoinHandle<()>,
}

impl ProgressDisplay {
    /// Subscribe to `bus` and draw a bar on stderr, or nothing when `visible` is false.
    #[must_use]
    pub fn attach(bus: &EventBus, visible: bool) -> Self {
        let bar = if visible {
            ProgressBar::new(TICKS)
        } else {
            ProgressBar::hidden()
        };
        if let Ok(bar_style) =
            ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {percent:>3}% {msg}")
        {
            bar.set_style(bar_style.progress_chars("=>-"));
        }

        let mut events = bus.subscribe();
        let task_bar = bar.clone();
        let task = tokio::spawn(async move {
            let mut done = 0.0_f64;
            loop {
                match events.recv().await {
                    Ok(BuildEvent::Progress {
                        allocation,
                        fraction,
                    }) => {
                        done = (done + fraction).min(1.0);
                        #[allow(
                            clippy::cast_possible_truncation,
                            clippy::cast_sign_loss,
                            clippy::cast_precision_loss
                        )]
                        task_bar.set_position((done * TICKS as f64).round() as u64);
                        let step = allocation.rsplit(" > ").next().unwrap_or_default();
                        task_bar.set_message(step.to_string());
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Self { bar, task }
    }

    /// Stop following events and remove the bar.
    pub fn finish(self, succeeded: bool) {
        self.task.abort();
        if succeeded {
            self.bar.finish_and_clear();
        } else {
            self.bar
                .abandon_with_message(style("failed").red().to_string());
        }
    }
}
