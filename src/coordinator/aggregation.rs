//! Aggregation of the results of a round.
//!
//! Two aggregators consume the same results:
//!
//! - [`MetricsAggregator`] averages the reported loss and accuracy, both
//!   unweighted and weighted by the number of samples of each participant.
//! - [`ModelAggregator`] computes the sample-weighted average of the
//!   [`Parameter::Float`] parameters of the returned model states. The
//!   [`Parameter::Index`] parameters are carried over from the global state.

use thiserror::Error;

use crate::message::{ModelState, Parameter, ParameterKind, RoundResult};

/// Aggregates local results into a global value.
pub trait Aggregator {
    type Output;
    type Error;

    /// Validate a local result and add it to the aggregation.
    fn add_local_result(&mut self, result: &RoundResult) -> Result<(), Self::Error>;

    /// Compute the aggregated value from the results added so far.
    fn aggregate(&mut self) -> Result<Self::Output, Self::Error>;
}

#[derive(Debug, Error, PartialEq)]
/// Errors that can occur during aggregation.
pub enum AggregationError {
    #[error("non finite metrics: loss {loss}, accuracy {accuracy}")]
    NonFinite { loss: f64, accuracy: f64 },
    #[error("{added} samples overflow the {total} samples already aggregated")]
    SampleOverflow { total: u64, added: u64 },
    #[error("parameter {0} is missing")]
    MissingParameter(String),
    #[error("parameter {name} is of kind {found} but {expected} was expected")]
    KindMismatch {
        name: String,
        expected: ParameterKind,
        found: ParameterKind,
    },
    #[error("parameter {name} has shape {found:?} but {expected:?} was expected")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
}

/// The aggregated metrics of a round.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MetricSummary {
    pub responded: usize,
    pub total_samples: u64,
    pub mean_loss: f64,
    pub mean_accuracy: f64,
    pub weighted_loss: f64,
    pub weighted_accuracy: f64,
}

/// Averages the loss and accuracy of the local results.
#[derive(Debug, Default)]
pub struct MetricsAggregator {
    count: usize,
    total_samples: u64,
    loss_sum: f64,
    accuracy_sum: f64,
    weighted_loss_sum: f64,
    weighted_accuracy_sum: f64,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Aggregator for MetricsAggregator {
    type Output = MetricSummary;
    type Error = AggregationError;

    fn add_local_result(&mut self, result: &RoundResult) -> Result<(), Self::Error> {
        if !result.has_finite_metrics() {
            return Err(AggregationError::NonFinite {
                loss: result.loss,
                accuracy: result.accuracy,
            });
        }

        let total_samples = self
            .total_samples
            .checked_add(result.sample_count)
            .ok_or(AggregationError::SampleOverflow {
                total: self.total_samples,
                added: result.sample_count,
            })?;

        let samples = result.sample_count as f64;
        self.count += 1;
        self.total_samples = total_samples;
        self.loss_sum += result.loss;
        self.accuracy_sum += result.accuracy;
        self.weighted_loss_sum += samples * result.loss;
        self.weighted_accuracy_sum += samples * result.accuracy;
        Ok(())
    }

    fn aggregate(&mut self) -> Result<Self::Output, Self::Error> {
        if self.count == 0 {
            return Ok(MetricSummary::default());
        }

        let count = self.count as f64;
        let mean_loss = self.loss_sum / count;
        let mean_accuracy = self.accuracy_sum / count;
        // without any sample, every participant weighs the same
        let (weighted_loss, weighted_accuracy) = if self.total_samples == 0 {
            (mean_loss, mean_accuracy)
        } else {
            let total = self.total_samples as f64;
            (
                self.weighted_loss_sum / total,
                self.weighted_accuracy_sum / total,
            )
        };

        Ok(MetricSummary {
            responded: self.count,
            total_samples: self.total_samples,
            mean_loss,
            mean_accuracy,
            weighted_loss,
            weighted_accuracy,
        })
    }
}

/// Computes the weighted average of the returned model states.
///
/// The layout of the aggregated state is given by a template: the previous
/// global state if it has parameters, otherwise the first non empty state
/// that was added. Every added state must provide all the float parameters
/// of the template with the same shape. Empty states are ignored.
#[derive(Debug)]
pub struct ModelAggregator {
    template: Option<ModelState>,
    updates: Vec<(u64, ModelState)>,
}

impl ModelAggregator {
    pub fn new(global: &ModelState) -> Self {
        let template = if global.is_empty() {
            None
        } else {
            Some(global.clone())
        };
        Self {
            template,
            updates: Vec::new(),
        }
    }

    /// The number of states added so far.
    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    /// Check that the given state can be aggregated with the template.
    fn validate_aggregation(
        template: &ModelState,
        state: &ModelState,
    ) -> Result<(), AggregationError> {
        for (name, expected) in template.iter() {
            if expected.kind() != ParameterKind::Float {
                continue;
            }
            let found = state
                .get(name)
                .ok_or_else(|| AggregationError::MissingParameter(name.clone()))?;
            if found.kind() != ParameterKind::Float {
                return Err(AggregationError::KindMismatch {
                    name: name.clone(),
                    expected: ParameterKind::Float,
                    found: found.kind(),
                });
            }
            if found.shape() != expected.shape() {
                return Err(AggregationError::ShapeMismatch {
                    name: name.clone(),
                    expected: expected.shape().to_vec(),
                    found: found.shape().to_vec(),
                });
            }
        }
        Ok(())
    }
}

impl Aggregator for ModelAggregator {
    /// `None` if no state was added.
    type Output = Option<ModelState>;
    type Error = AggregationError;

    fn add_local_result(&mut self, result: &RoundResult) -> Result<(), Self::Error> {
        if result.state.is_empty() {
            return Ok(());
        }

        match self.template {
            Some(ref template) => Self::validate_aggregation(template, &result.state)?,
            None => self.template = Some(result.state.clone()),
        }
        self.updates.push((result.sample_count, result.state.clone()));
        Ok(())
    }

    fn aggregate(&mut self) -> Result<Self::Output, Self::Error> {
        let template = match (&self.template, self.updates.is_empty()) {
            (Some(template), false) => template,
            _ => return Ok(None),
        };

        // the reported sample counts may overflow a u64 sum
        let total_samples: f64 = self.updates.iter().map(|(samples, _)| *samples as f64).sum();
        let weights: Vec<f64> = if total_samples == 0.0 {
            vec![1.0 / self.updates.len() as f64; self.updates.len()]
        } else {
            self.updates
                .iter()
                .map(|(samples, _)| *samples as f64 / total_samples)
                .collect()
        };

        let mut aggregated = ModelState::new();
        for (name, parameter) in template.iter() {
            let (shape, len) = match parameter {
                Parameter::Float { shape, values } => (shape, values.len()),
                Parameter::Index { .. } => {
                    aggregated.insert(name.clone(), parameter.clone());
                    continue;
                }
            };

            let mut values = vec![0.0; len];
            for ((_, state), weight) in self.updates.iter().zip(weights.iter()) {
                let update = match state.get(name) {
                    Some(Parameter::Float { values: update, .. }) => update,
                    Some(other) => {
                        return Err(AggregationError::KindMismatch {
                            name: name.clone(),
                            expected: ParameterKind::Float,
                            found: other.kind(),
                        })
                    }
                    None => return Err(AggregationError::MissingParameter(name.clone())),
                };
                for (sum, value) in values.iter_mut().zip(update.iter()) {
                    *sum += weight * value;
                }
            }
            aggregated.insert(
                name.clone(),
                Parameter::Float {
                    shape: shape.clone(),
                    values,
                },
            );
        }

        Ok(Some(aggregated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(sample_count: u64, loss: f64, accuracy: f64, state: ModelState) -> RoundResult {
        RoundResult {
            round: 1,
            sample_count,
            loss,
            accuracy,
            state,
        }
    }

    fn state(weights: Vec<f64>, embedding: Option<Vec<i64>>) -> ModelState {
        let mut state = ModelState::new();
        state.insert(
            "dense.weight",
            Parameter::float(vec![weights.len()], weights).unwrap(),
        );
        if let Some(indices) = embedding {
            state.insert(
                "embedding.index",
                Parameter::index(vec![indices.len()], indices).unwrap(),
            );
        }
        state
    }

    fn float_values(state: &ModelState, name: &str) -> Vec<f64> {
        match state.get(name) {
            Some(Parameter::Float { values, .. }) => values.clone(),
            other => panic!("unexpected parameter: {:?}", other),
        }
    }

    #[test]
    fn test_mean_metrics() {
        let mut aggregator = MetricsAggregator::new();
        for accuracy in [0.5, 0.7, 0.9] {
            aggregator
                .add_local_result(&result(100, 1.0 - accuracy, accuracy, ModelState::new()))
                .unwrap();
        }
        let summary = aggregator.aggregate().unwrap();
        assert_eq!(summary.responded, 3);
        assert_eq!(summary.total_samples, 300);
        assert!((summary.mean_accuracy - 0.7).abs() < 1e-9);
        assert!((summary.mean_loss - 0.3).abs() < 1e-9);
        assert!((summary.weighted_accuracy - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_weighted_metrics() {
        let mut aggregator = MetricsAggregator::new();
        aggregator
            .add_local_result(&result(10, 0.8, 0.2, ModelState::new()))
            .unwrap();
        aggregator
            .add_local_result(&result(30, 0.2, 0.8, ModelState::new()))
            .unwrap();
        let summary = aggregator.aggregate().unwrap();
        assert!((summary.weighted_accuracy - 0.65).abs() < 1e-9);
        assert!((summary.weighted_loss - 0.35).abs() < 1e-9);
        assert!((summary.mean_accuracy - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_metrics_without_samples() {
        let mut aggregator = MetricsAggregator::new();
        aggregator
            .add_local_result(&result(0, 0.4, 0.6, ModelState::new()))
            .unwrap();
        aggregator
            .add_local_result(&result(0, 0.2, 0.8, ModelState::new()))
            .unwrap();
        let summary = aggregator.aggregate().unwrap();
        assert!((summary.weighted_accuracy - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_sample_overflow() {
        let half = u64::MAX / 2 + 1;
        let mut aggregator = MetricsAggregator::new();
        aggregator
            .add_local_result(&result(half, 0.4, 0.6, ModelState::new()))
            .unwrap();
        let err = aggregator
            .add_local_result(&result(half, 0.2, 0.8, ModelState::new()))
            .unwrap_err();
        assert_eq!(
            err,
            AggregationError::SampleOverflow {
                total: half,
                added: half,
            }
        );

        let summary = aggregator.aggregate().unwrap();
        assert_eq!(summary.responded, 1);
        assert_eq!(summary.total_samples, half);
        assert!((summary.weighted_accuracy - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_model_with_huge_sample_counts() {
        let half = u64::MAX / 2 + 1;
        let mut aggregator = ModelAggregator::new(&ModelState::new());
        aggregator
            .add_local_result(&result(half, 0.5, 0.5, state(vec![1.0], None)))
            .unwrap();
        aggregator
            .add_local_result(&result(half, 0.5, 0.5, state(vec![3.0], None)))
            .unwrap();
        let aggregated = aggregator.aggregate().unwrap().unwrap();
        assert!((float_values(&aggregated, "dense.weight")[0] - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_metrics_without_results() {
        let summary = MetricsAggregator::new().aggregate().unwrap();
        assert_eq!(summary, MetricSummary::default());
        assert_eq!(summary.mean_accuracy, 0.0);
    }

    #[test]
    fn test_non_finite_metrics() {
        let mut aggregator = MetricsAggregator::new();
        let err = aggregator
            .add_local_result(&result(10, f64::NAN, 0.5, ModelState::new()))
            .unwrap_err();
        assert!(matches!(err, AggregationError::NonFinite { .. }));
        assert_eq!(aggregator.aggregate().unwrap().responded, 0);
    }

    #[test]
    fn test_weighted_model() {
        let global = state(vec![0.0, 0.0], Some(vec![7, 8]));
        let mut aggregator = ModelAggregator::new(&global);
        aggregator
            .add_local_result(&result(10, 0.5, 0.5, state(vec![1.0, 2.0], Some(vec![0, 0]))))
            .unwrap();
        aggregator
            .add_local_result(&result(30, 0.5, 0.5, state(vec![3.0, 6.0], None)))
            .unwrap();
        // empty states don't take part in the aggregation
        aggregator
            .add_local_result(&result(60, 0.5, 0.5, ModelState::new()))
            .unwrap();
        assert_eq!(aggregator.len(), 2);

        let aggregated = aggregator.aggregate().unwrap().unwrap();
        let weights = float_values(&aggregated, "dense.weight");
        assert!((weights[0] - 3.0).abs() < 1e-9);
        assert!((weights[1] - 5.0).abs() < 1e-9);
        assert_eq!(
            aggregated.get("embedding.index"),
            global.get("embedding.index")
        );
    }

    #[test]
    fn test_model_template_from_first_update() {
        let mut aggregator = ModelAggregator::new(&ModelState::new());
        aggregator
            .add_local_result(&result(0, 0.5, 0.5, state(vec![1.0], None)))
            .unwrap();
        aggregator
            .add_local_result(&result(0, 0.5, 0.5, state(vec![2.0], None)))
            .unwrap();
        let aggregated = aggregator.aggregate().unwrap().unwrap();
        assert!((float_values(&aggregated, "dense.weight")[0] - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_model_shape_mismatch() {
        let mut aggregator = ModelAggregator::new(&state(vec![0.0, 0.0], None));
        let err = aggregator
            .add_local_result(&result(10, 0.5, 0.5, state(vec![1.0, 2.0, 3.0], None)))
            .unwrap_err();
        assert_eq!(
            err,
            AggregationError::ShapeMismatch {
                name: "dense.weight".into(),
                expected: vec![2],
                found: vec![3],
            }
        );
        assert!(aggregator.is_empty());
    }

    #[test]
    fn test_model_missing_parameter() {
        let mut aggregator = ModelAggregator::new(&state(vec![0.0], None));
        let mut other = ModelState::new();
        other.insert("dense.bias", Parameter::float(vec![1], vec![0.0]).unwrap());
        let err = aggregator
            .add_local_result(&result(10, 0.5, 0.5, other))
            .unwrap_err();
        assert_eq!(err, AggregationError::MissingParameter("dense.weight".into()));
    }

    #[test]
    fn test_model_kind_mismatch() {
        let mut aggregator = ModelAggregator::new(&state(vec![0.0], None));
        let mut other = ModelState::new();
        other.insert("dense.weight", Parameter::index(vec![1], vec![0]).unwrap());
        let err = aggregator
            .add_local_result(&result(10, 0.5, 0.5, other))
            .unwrap_err();
        assert!(matches!(err, AggregationError::KindMismatch { .. }));
    }

    #[test]
    fn test_model_without_states() {
        let mut aggregator = ModelAggregator::new(&state(vec![0.0], None));
        assert_eq!(aggregator.aggregate().unwrap(), None);

        let mut aggregator = ModelAggregator::new(&ModelState::new());
        aggregator
            .add_local_result(&result(10, 0.5, 0.5, ModelState::new()))
            .unwrap();
        assert_eq!(aggregator.aggregate().unwrap(), None);
    }
}
