use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

/// Shows the iterations of a run, and the loss of the last and the best one
pub struct ProgressBars {
    iteration_pb: ProgressBar,
    loss_pb: ProgressBar,

    total_len: usize,
}

impl ProgressBars {
    pub fn new() -> Self {
        let multi_pb = MultiProgress::new();
        let sty = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({eta})")
            .progress_chars("##-");

        let iteration_pb = multi_pb.add(ProgressBar::new(100));
        iteration_pb.set_style(sty);

        let sty = ProgressStyle::default_bar().template(" {msg}");
        let loss_pb = multi_pb.add(ProgressBar::new(1));
        loss_pb.set_style(sty);

        std::thread::spawn(move || {
            let _ = multi_pb.join();
        });

        Self {
            iteration_pb,
            loss_pb,
            total_len: 100,
        }
    }
}

impl Drop for ProgressBars {
    fn drop(&mut self) {
        self.iteration_pb.finish();
        self.loss_pb.finish();
    }
}

impl neural_style::RunProgress for ProgressBars {
    fn update(&mut self, update: neural_style::ProgressUpdate<'_>) {
        if update.iteration.total != self.total_len {
            self.total_len = update.iteration.total;
            self.iteration_pb.set_length(self.total_len as u64);
        }

        self.iteration_pb
            .set_position(update.iteration.current as u64);

        self.loss_pb.set_message(&format!(
            "loss {:.4e} (content {:.4e}, style {:.4e}), best {:.4e} at iteration {}",
            update.loss.total,
            update.loss.content,
            update.loss.style,
            update.best_loss.total,
            update.best_iteration,
        ));
    }
}
