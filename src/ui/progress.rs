use std::time::Duration;

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use serde_json::Value;

use crate::gate::GateDecision;
use crate::progress::{EventType, ProgressEvent};
use crate::ui::icons::{BLOCKER, CHECK, CROSS, PAGE, SPARKLE, WARN};

fn field<'a>(data: &'a Value, key: &str) -> &'a str {
    data.get(key).and_then(Value::as_str).unwrap_or("")
}

/// Terminal UI for `dossier run`, rendered via `indicatif` progress bars.
///
/// Two bars are stacked vertically: a phase bar counting approved phases and
/// a spinner showing the latest progress event of the running phase.
pub struct RunUI {
    multi: MultiProgress,
    phase_bar: ProgressBar,
    step_bar: ProgressBar,
    verbose: bool,
}

impl RunUI {
    pub fn new(total_phases: u64, verbose: bool) -> Self {
        let multi = MultiProgress::new();

        let phase_style = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .expect("progress bar template is a valid static string")
            .progress_chars("█▓▒░");
        let phase_bar = multi.add(ProgressBar::new(total_phases));
        phase_bar.set_style(phase_style);
        phase_bar.set_prefix("Phases");

        let step_style = ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {spinner} {msg}")
            .expect("progress bar template is a valid static string");
        let step_bar = multi.add(ProgressBar::new_spinner());
        step_bar.set_style(step_style);
        step_bar.set_prefix("  Step");

        Self {
            multi,
            phase_bar,
            step_bar,
            verbose,
        }
    }

    /// Print through `MultiProgress`, falling back to stderr.
    fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    pub fn start_phase(&self, phase: &str) {
        self.phase_bar.set_message(format!("{}", style(phase).yellow()));
        self.step_bar.set_message(format!("{}", style("starting...").dim()));
        self.step_bar.enable_steady_tick(Duration::from_millis(100));
    }

    /// Render one hub event.
    pub fn show_event(&self, event: &ProgressEvent) {
        let data = &event.data;
        match event.event_type {
            EventType::Progress => {
                let stage = field(data, "stage");
                let message = field(data, "message");
                match stage {
                    "page" => self.print_line(format!(
                        "    {}{} {}",
                        PAGE,
                        message,
                        style(format!("({} words)", data["words"])).dim()
                    )),
                    "page_failed" => self.print_line(format!(
                        "    {}{} {}",
                        WARN,
                        message,
                        style(field(data, "error")).red()
                    )),
                    _ if self.verbose => self.print_line(format!(
                        "    {} {}",
                        style("→").dim(),
                        style(format!("{} {}", stage, message)).dim()
                    )),
                    _ => {}
                }
                let shown = if message.is_empty() { stage } else { message };
                self.step_bar.set_message(shown.to_string());
            }
            EventType::Error => {
                self.print_line(format!("    {}{}", CROSS, style(field(data, "message")).red()));
            }
            EventType::Connected | EventType::Ping | EventType::End => {}
        }
    }

    pub fn phase_approved(&self, phase: &str, review: &GateDecision) {
        self.phase_bar.inc(1);
        self.step_bar.set_message("");
        self.print_line(format!(
            "{}Phase {} approved {}",
            CHECK,
            style(phase).green().bold(),
            style(format!("(score {})", review.score)).dim()
        ));
    }

    pub fn phase_blocked(&self, phase: &str, review: &GateDecision) {
        self.print_line(format!(
            "{}Phase {} blocked at score {}: {}",
            BLOCKER,
            style(phase).yellow().bold(),
            style(review.score).red(),
            review.reason
        ));
    }

    pub fn phase_failed(&self, phase: &str, reason: &str) {
        self.print_line(format!(
            "{}Phase {} failed: {}",
            CROSS,
            style(phase).red().bold(),
            reason
        ));
    }

    /// Stop the spinners. `completed` prints the closing banner.
    pub fn finish(&self, completed: bool) {
        self.step_bar.finish_and_clear();
        if completed {
            self.phase_bar.finish_with_message("done");
            self.print_line(format!("\n{}{}\n", SPARKLE, style("Dossier complete!").green().bold()));
        } else {
            self.phase_bar.abandon();
        }
    }
}
