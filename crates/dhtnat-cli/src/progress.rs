//! Spinner shown while a punch session runs.

use console::style;
use dhtnat::PunchResult;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Spinner for one punch session
pub struct PunchProgress {
    bar: ProgressBar,
}

impl PunchProgress {
    /// Start spinning for `target`
    #[must_use]
    pub fn new(target: &str) -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.set_message(format!("Punching {target}"));
        bar.enable_steady_tick(Duration::from_millis(100));
        Self { bar }
    }

    /// Stop and print the outcome
    pub fn finish(&self, result: &PunchResult) {
        let message = match result.reachable_addr() {
            Some(addr) => format!("{} reachable at {addr}", style("ok").green().bold()),
            None => format!(
                "{} {}",
                style("failed").red().bold(),
                result
                    .failure_reason()
                    .map_or("unknown", |reason| reason.as_str())
            ),
        };
        self.bar.finish_with_message(message);
    }

    /// Stop after an error
    pub fn abandon(&self, error: &str) {
        self.bar
            .abandon_with_message(format!("{} {error}", style("error").red().bold()));
    }
}

/// Format a duration as milliseconds
#[must_use]
pub fn format_rtt(rtt: Duration) -> String {
    format!("{:.1} ms", rtt.as_secs_f64() * 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_rtt() {
        assert_eq!(format_rtt(Duration::from_micros(1500)), "1.5 ms");
        assert_eq!(format_rtt(Duration::ZERO), "0.0 ms");
    }
}
