//! Terminal progress rendering.

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use lumen_train::{ProgressEvent, ProgressSink, RunState};

pub struct IndicatifProgressSink {
    bar: ProgressBar,
}

impl IndicatifProgressSink {
    pub fn new() -> Self {
        let bar = ProgressBar::hidden();
        if let Ok(style) = ProgressStyle::default_bar().template("{bar:40.cyan/blue} {pos}/{len} steps {msg}") {
            bar.set_style(style.progress_chars("=> "));
        }
        Self { bar }
    }
}

impl Default for IndicatifProgressSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for IndicatifProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::State { state, .. } => match state {
                RunState::Fitting => self.bar.set_draw_target(indicatif::ProgressDrawTarget::stderr()),
                RunState::Exported => self.bar.finish_with_message("done".green().to_string()),
                RunState::Failed => self.bar.abandon_with_message("failed".red().to_string()),
                _ => {}
            },
            ProgressEvent::Message { message, .. } => self.bar.println(message),
            ProgressEvent::Step { epoch, step, total, loss, .. } => {
                if let Some(total) = total {
                    self.bar.set_length(total);
                }
                self.bar.set_position(step);
                let loss = loss.map_or_else(String::new, |l| format!("loss {l:.4}"));
                self.bar.set_message(format!("epoch {epoch} {loss}"));
            }
        }
    }
}
