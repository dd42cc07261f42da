use std::collections::VecDeque;

/// The number of trainings kept in the history.
pub const HISTORY_WINDOW: usize = 10;

/// The outcome of a local training, as seen by the participant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingRecord {
    pub round: u64,
    pub loss: f64,
    pub accuracy: f64,
}

/// The most recent trainings of a participant.
#[derive(Debug, Default, Clone)]
pub struct TrainingHistory {
    records: VecDeque<TrainingRecord>,
    total_trainings: u64,
}

impl TrainingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a training, dropping the oldest one if the window is full.
    pub fn record(&mut self, record: TrainingRecord) {
        if self.records.len() == HISTORY_WINDOW {
            self.records.pop_front();
        }
        self.records.push_back(record);
        self.total_trainings += 1;
    }

    pub fn latest(&self) -> Option<&TrainingRecord> {
        self.records.back()
    }

    /// The training with the highest accuracy within the window.
    pub fn best(&self) -> Option<&TrainingRecord> {
        self.records
            .iter()
            .max_by(|a, b| a.accuracy.total_cmp(&b.accuracy))
    }

    /// The average accuracy within the window.
    pub fn average_accuracy(&self) -> Option<f64> {
        if self.records.is_empty() {
            return None;
        }
        let sum: f64 = self.records.iter().map(|record| record.accuracy).sum();
        Some(sum / self.records.len() as f64)
    }

    /// The number of trainings since the participant started, including
    /// those that left the window.
    pub fn total_trainings(&self) -> u64 {
        self.total_trainings
    }

    /// The round of the latest training, `0` if the participant never
    /// trained.
    pub fn current_round(&self) -> u64 {
        self.latest().map(|record| record.round).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrainingRecord> {
        self.records.iter()
    }
}
