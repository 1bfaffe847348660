use indicatif::{ProgressBar, ProgressStyle};

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(
            "[{spinner:.green} {elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({percent}%) {msg}",
        )
        .expect("Failed to create progress bar")
        .progress_chars("#>-")
}

/// Progress for one tool step. Starts as a spinner and turns into a
/// percentage bar once the tool reports a percentage.
pub(crate) struct StepProgress {
    pb: ProgressBar,
}

impl StepProgress {
    pub(crate) fn new(msg: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("[{spinner:.green} {elapsed_precise}] {msg}")
                .expect("Failed to create spinner"),
        );
        pb.set_message(msg.to_owned());

        StepProgress { pb }
    }

    pub(crate) fn enable_steady_tick(&self, interval: std::time::Duration) {
        self.pb.enable_steady_tick(interval);
    }

    /// Feed one line of tool output
    pub(crate) fn update(&self, line: &str) {
        let Some(percent) = parse_percentage(line) else {
            return;
        };
        if self.pb.length().is_none() {
            self.pb.set_style(bar_style());
            self.pb.set_length(100);
        }
        self.pb.set_position(percent);
    }

    pub(crate) fn finish(&self) {
        self.pb.finish_and_clear();
    }
}

/// Pull a progress percentage out of tool output such as
/// `Write LBA from file (45%)` or `Download image... 45%`
pub(crate) fn parse_percentage(line: &str) -> Option<u64> {
    let end = line.rfind('%')?;
    let digits_start = line[..end]
        .rfind(|c: char| !c.is_ascii_digit())
        .map(|i| i + 1)
        .unwrap_or(0);
    let value: u64 = line[digits_start..end].parse().ok()?;
    (value <= 100).then_some(value)
}
