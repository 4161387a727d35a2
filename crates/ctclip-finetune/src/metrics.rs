//! Training progress logging

/// Metrics for a single training step
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingMetrics {
    /// Epoch index (0-based)
    pub epoch: usize,
    /// Batch index within the epoch
    pub batch_index: usize,
    /// Batches per epoch
    pub num_batches: usize,
    /// Loss value
    pub loss: f32,
    /// Seconds spent reading and collating the batch
    pub data_time: f32,
    /// Seconds for the whole step
    pub batch_time: f32,
}

impl TrainingMetrics {
    /// Progress line in the training log format
    pub fn format_progress(&self) -> String {
        let percent_complete = if self.num_batches > 0 {
            100.0 * self.batch_index as f32 / self.num_batches as f32
        } else {
            0.0
        };
        format!(
            "Train Epoch: {} [{:.0}% {}/{}]\tLoss: {:.6}\tData (t) {:.3}\tBatch (t) {:.3}",
            self.epoch,
            percent_complete,
            self.batch_index,
            self.num_batches,
            self.loss,
            self.data_time,
            self.batch_time
        )
    }
}

/// Metrics logger for training
pub struct MetricsLogger {
    print_every: usize,
    logged: usize,
}

impl MetricsLogger {
    /// Create a logger that reports every `print_every` batches
    pub fn new(print_every: usize) -> Self {
        Self {
            print_every: print_every.max(1),
            logged: 0,
        }
    }

    /// Whether batch `batch_index` gets a progress line
    pub fn should_log(&self, batch_index: usize) -> bool {
        batch_index % self.print_every == 0
    }

    /// Log `metrics` if its batch index falls on the interval
    ///
    /// # Returns
    /// True if a line was written
    pub fn log_step(&mut self, metrics: &TrainingMetrics) -> bool {
        if !self.should_log(metrics.batch_index) {
            return false;
        }
        log::info!("{}", metrics.format_progress());
        self.logged += 1;
        true
    }

    /// Number of progress lines written
    pub fn logged(&self) -> usize {
        self.logged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_format() {
        let metrics = TrainingMetrics {
            epoch: 1,
            batch_index: 25,
            num_batches: 100,
            loss: 0.6931472,
            data_time: 0.01234,
            batch_time: 1.5,
        };
        assert_eq!(
            metrics.format_progress(),
            "Train Epoch: 1 [25% 25/100]\tLoss: 0.693147\tData (t) 0.012\tBatch (t) 1.500"
        );
    }

    #[test]
    fn test_log_interval() {
        let mut logger = MetricsLogger::new(10);
        let mut metrics = TrainingMetrics {
            epoch: 0,
            batch_index: 0,
            num_batches: 30,
            loss: 1.0,
            data_time: 0.0,
            batch_time: 0.0,
        };
        assert!(logger.log_step(&metrics));
        metrics.batch_index = 5;
        assert!(!logger.log_step(&metrics));
        metrics.batch_index = 20;
        assert!(logger.log_step(&metrics));
        assert_eq!(logger.logged(), 2);
    }
}
