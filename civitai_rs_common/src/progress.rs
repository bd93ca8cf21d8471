use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

const BAR_TEMPLATE: &str = "[{elapsed_precise}] [{bar:40.cyan/blue}] {msg}";
const SPINNER_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] {bytes} downloaded ({bytes_per_sec})";

/// Percentage of `total` covered by `downloaded`. `None` when the total is unknown (zero).
pub fn percentage(downloaded: u64, total: u64) -> Option<f64> {
    if total == 0 {
        return None;
    }
    Some(downloaded as f64 / total as f64 * 100.0)
}

/// The `Progress: 12.5% (1024/8192 bytes)` readout, when a total is known.
pub fn progress_line(downloaded: u64, total: Option<u64>) -> Option<String> {
    let total = total?;
    percentage(downloaded, total)
        .map(|pct| format!("Progress: {pct:.1}% ({downloaded}/{total} bytes)"))
}

/// Progress display for a single streamed download.
///
/// With a declared content length this is a bar carrying the percentage readout;
/// without one only a byte counter is shown.
pub struct DownloadProgress {
    bar: ProgressBar,
    total: Option<u64>,
}

impl DownloadProgress {
    pub fn new(total: Option<u64>, silent: bool) -> Self {
        let total = total.filter(|&t| t > 0);
        let bar = if silent {
            ProgressBar::hidden()
        } else {
            let style = match total {
                Some(_) => ProgressStyle::with_template(BAR_TEMPLATE)
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("=> "),
                None => ProgressStyle::with_template(SPINNER_TEMPLATE)
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            };
            ProgressBar::with_draw_target(total, ProgressDrawTarget::stdout()).with_style(style)
        };
        Self { bar, total }
    }

    pub fn update(&self, downloaded: u64) {
        self.bar.set_position(downloaded);
        if let Some(line) = progress_line(downloaded, self.total) {
            self.bar.set_message(line);
        }
    }

    pub fn finish(&self) {
        self.bar.finish();
    }

    pub fn abandon(&self) {
        self.bar.abandon();
    }
}
