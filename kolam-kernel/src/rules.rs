//! Threshold rules for pond water quality.
//!
//! Each metric has a *warning* band (the normal range) and a wider
//! *critical* band. A value outside the critical band is critical, outside
//! only the warning band is a warning, inside is normal. Bounds are
//! exclusive: a value equal to a bound is still inside.

use crate::models::{AlertCandidate, AlertSource, MetricKind, Reading, Severity};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid {metric} thresholds: {reason}")]
pub struct RuleConfigInvalid {
    pub metric: MetricKind,
    pub reason: String,
}

/// A range with optional lower and upper bounds.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Band {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl Band {
    pub const fn between(min: f64, max: f64) -> Self {
        Self { min: Some(min), max: Some(max) }
    }

    pub const fn at_least(min: f64) -> Self {
        Self { min: Some(min), max: None }
    }

    pub fn excludes(&self, value: f64) -> bool {
        self.min.is_some_and(|min| value < min) || self.max.is_some_and(|max| value > max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricThresholds {
    /// Normal range; leaving it raises a warning.
    pub warning: Band,
    /// Leaving it raises a critical alert.
    pub critical: Band,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdTable {
    pub temperature: MetricThresholds,
    pub oxygen: MetricThresholds,
    pub ph: MetricThresholds,
}

impl Default for ThresholdTable {
    fn default() -> Self {
        Self {
            temperature: MetricThresholds {
                warning: Band::between(20.0, 30.0),
                critical: Band::between(15.0, 35.0),
            },
            oxygen: MetricThresholds {
                warning: Band::at_least(5.0),
                critical: Band::at_least(3.0),
            },
            ph: MetricThresholds {
                warning: Band::between(6.5, 8.5),
                critical: Band::between(6.0, 9.0),
            },
        }
    }
}

impl ThresholdTable {
    pub fn get(&self, metric: MetricKind) -> &MetricThresholds {
        match metric {
            MetricKind::Temperature => &self.temperature,
            MetricKind::Oxygen => &self.oxygen,
            MetricKind::Ph => &self.ph,
        }
    }

    pub fn validate(&self) -> Result<(), RuleConfigInvalid> {
        for metric in MetricKind::ALL {
            validate_metric(metric, self.get(metric))?;
        }
        Ok(())
    }
}

fn validate_metric(metric: MetricKind, t: &MetricThresholds) -> Result<(), RuleConfigInvalid> {
    let invalid = |reason: String| RuleConfigInvalid { metric, reason };

    for (name, band) in [("warning", &t.warning), ("critical", &t.critical)] {
        for bound in [band.min, band.max].into_iter().flatten() {
            if !bound.is_finite() {
                return Err(invalid(format!("{name} band has a non-finite bound")));
            }
        }
        if let (Some(min), Some(max)) = (band.min, band.max) {
            if min >= max {
                return Err(invalid(format!("{name} band min {min} is not below max {max}")));
            }
        }
    }

    if t.warning.min.is_none() && t.warning.max.is_none() {
        return Err(invalid("warning band has no bound, alerting would be disabled".into()));
    }

    // The critical band must enclose the warning band on every bounded side.
    if let Some(crit_min) = t.critical.min {
        match t.warning.min {
            Some(warn_min) if crit_min <= warn_min => {}
            Some(warn_min) => {
                return Err(invalid(format!("critical min {crit_min} is above warning min {warn_min}")))
            }
            None => return Err(invalid("critical min set without a warning min".into())),
        }
    }
    if let Some(crit_max) = t.critical.max {
        match t.warning.max {
            Some(warn_max) if crit_max >= warn_max => {}
            Some(warn_max) => {
                return Err(invalid(format!("critical max {crit_max} is below warning max {warn_max}")))
            }
            None => return Err(invalid("critical max set without a warning max".into())),
        }
    }
    Ok(())
}

/// Stateless evaluator over a validated threshold table.
#[derive(Debug, Clone)]
pub struct RuleEvaluator {
    table: ThresholdTable,
}

impl RuleEvaluator {
    pub fn new(table: ThresholdTable) -> Result<Self, RuleConfigInvalid> {
        table.validate()?;
        Ok(Self { table })
    }

    /// `None` when the value is inside the normal range.
    pub fn classify(&self, metric: MetricKind, value: f64) -> Option<Severity> {
        let t = self.table.get(metric);
        if t.critical.excludes(value) {
            Some(Severity::Critical)
        } else if t.warning.excludes(value) {
            Some(Severity::Warning)
        } else {
            None
        }
    }

    /// Candidate alerts for a reading, in temperature, oxygen, pH order.
    pub fn evaluate(&self, reading: &Reading) -> Vec<AlertCandidate> {
        MetricKind::ALL
            .into_iter()
            .filter_map(|metric| {
                let value = reading.value_of(metric);
                let severity = self.classify(metric, value)?;
                Some(AlertCandidate {
                    metric,
                    severity,
                    message: self.describe(metric, value),
                    value,
                    pond_id: reading.pond_id.clone(),
                    source: AlertSource::Rule,
                })
            })
            .collect()
    }

    /// Human-readable message embedding the value and the normal range.
    pub fn describe(&self, metric: MetricKind, value: f64) -> String {
        let (label, unit) = match metric {
            MetricKind::Temperature => ("Temperature", "°C"),
            MetricKind::Oxygen => ("Oxygen level", " mg/L"),
            MetricKind::Ph => ("pH level", ""),
        };
        let normal = self.table.get(metric).warning;
        match (normal.min, normal.max) {
            (Some(min), Some(max)) => {
                format!("{label} {value}{unit} is out of normal range ({min}-{max}{unit})")
            }
            (Some(min), None) => {
                format!("{label} {value}{unit} is below recommended minimum ({min}{unit})")
            }
            (None, Some(max)) => {
                format!("{label} {value}{unit} is above recommended maximum ({max}{unit})")
            }
            (None, None) => format!("{label} {value}{unit} is out of range"),
        }
    }
}
