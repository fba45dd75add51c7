use indicatif::{ProgressBar, ProgressStyle};
use neural_style::{ProgressUpdate, TransferProgress};

pub struct ProgressDisplay {
    pb: ProgressBar,
    total_len: u32,
}

impl ProgressDisplay {
    pub fn new() -> Self {
        let sty = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>4}/{len:4} {msg}")
            .progress_chars("##-");

        let pb = ProgressBar::new(100);
        pb.set_style(sty);

        Self { pb, total_len: 100 }
    }
}

impl Drop for ProgressDisplay {
    fn drop(&mut self) {
        self.pb.finish();
    }
}

impl TransferProgress for ProgressDisplay {
    fn update(&mut self, update: ProgressUpdate<'_>) {
        if update.total != self.total_len {
            self.total_len = update.total;
            self.pb.set_length(u64::from(self.total_len));
        }

        self.pb.set_message(&format!(
            "style {:.4} content {:.4}",
            update.losses.style, update.losses.content
        ));
        self.pb.set_position(u64::from(update.step));
    }
}
