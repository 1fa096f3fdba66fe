use std::cmp::min;
use std::fmt::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Context;
use blaster_core::prelude::Step;
use indicatif::{ProgressBar, ProgressState, ProgressStyle};

use crate::types::BlasterResult;

/// Displays a progress bar over the planned runtime of the test so the user can see how long is
/// left. The bar is labelled with the step that is running.
pub struct Progress {
    bar: ProgressBar,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Progress {
    pub fn start(planned_runtime: Duration) -> BlasterResult<Self> {
        let bar = ProgressBar::new(planned_runtime.as_secs());
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} {msg} [{wide_bar:.cyan/blue}] [{elapsed_precise} / {planned_runtime}]",
            )
            .context("Failed to set progress style")?
            .with_key("planned_runtime", {
                let hours = planned_runtime.as_secs() / 3600;
                let minutes = (planned_runtime.as_secs() % 3600) / 60;
                let seconds = planned_runtime.as_secs() % 60;
                move |_state: &ProgressState, w: &mut dyn Write| {
                    let _ = write!(w, "{hours:02}:{minutes:02}:{seconds:02}");
                }
            })
            .progress_chars("#>-"),
        );

        let stop = Arc::new(AtomicBool::new(false));
        let handle = std::thread::Builder::new()
            .name("progress".to_string())
            .spawn({
                let bar = bar.clone();
                let stop = stop.clone();
                move || {
                    let start_time = Instant::now();
                    while !stop.load(Ordering::Relaxed) {
                        let new = min(start_time.elapsed().as_secs(), planned_runtime.as_secs());
                        bar.set_position(new);
                        std::thread::sleep(Duration::from_millis(500));
                    }
                    log::trace!("Progress thread shutting down");
                    bar.finish_and_clear();
                }
            })
            .context("Failed to start progress thread")?;

        Ok(Self {
            bar,
            stop,
            handle: Some(handle),
        })
    }

    pub fn set_step(&self, step: &Step) {
        self.bar
            .set_message(format!("step {} ({})", step.number, step.phase));
    }

    pub fn finish(mut self) {
        self.stop_thread();
    }

    fn stop_thread(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::warn!("Progress thread panicked");
            }
        }
    }
}

impl Drop for Progress {
    fn drop(&mut self) {
        self.stop_thread();
    }
}
