use serde::Serialize;

use crate::classes::ClassList;
use crate::classifier::ProbabilityVector;

/// Shown in place of a winning label when no class clears the threshold.
pub const NO_WINNER: &str = "---";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassReading {
    pub name: String,
    /// Probability rounded to 2 decimals
    pub value: f32,
    pub active: bool,
}

impl ClassReading {
    pub fn display_value(&self) -> String {
        format!("{:.2}", self.value)
    }
}

/// Per-class display values plus the overall winning label for one tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub readings: Vec<ClassReading>,
    pub winner: Option<usize>,
    pub winner_label: String,
}

/// Turns probability vectors into display values.
///
/// The winner is the first class in list order whose probability exceeds
/// the threshold, which is not necessarily the most probable one.
#[derive(Debug, Clone)]
pub struct ResultReporter {
    classes: ClassList,
}

impl ResultReporter {
    pub fn new(classes: ClassList) -> Self {
        Self { classes }
    }

    pub fn classes(&self) -> &ClassList {
        &self.classes
    }

    pub fn report(&self, probabilities: &ProbabilityVector, threshold: f32) -> Report {
        let readings: Vec<ClassReading> = self
            .classes
            .iter()
            .zip(probabilities.as_slice())
            .map(|(name, &p)| ClassReading {
                name: name.to_string(),
                value: round2(p),
                active: p > threshold,
            })
            .collect();

        let winner = readings.iter().position(|r| r.active);
        let winner_label = winner
            .and_then(|i| self.classes.name(i))
            .unwrap_or(NO_WINNER)
            .to_string();

        Report {
            readings,
            winner,
            winner_label,
        }
    }
}

fn round2(p: f32) -> f32 {
    (p * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reporter(names: &[&str]) -> ResultReporter {
        ResultReporter::new(ClassList::new(names.iter().copied()).unwrap())
    }

    #[test]
    fn first_match_wins_over_max() {
        let reporter = reporter(&["a", "b"]);
        let report = reporter.report(&ProbabilityVector::from(vec![0.6, 0.9]), 0.5);
        assert_eq!(report.winner, Some(0));
        assert_eq!(report.winner_label, "a");
        assert!(report.readings.iter().all(|r| r.active));
    }

    #[test]
    fn placeholder_when_nothing_clears_threshold() {
        let reporter = reporter(&["a", "b", "c"]);
        let report = reporter.report(&ProbabilityVector::from(vec![0.3, 0.3, 0.4]), 0.75);
        assert_eq!(report.winner, None);
        assert_eq!(report.winner_label, NO_WINNER);
        assert!(report.readings.iter().all(|r| !r.active));
    }

    #[test]
    fn threshold_is_strict() {
        let reporter = reporter(&["a", "b"]);
        let report = reporter.report(&ProbabilityVector::from(vec![0.5, 0.5]), 0.5);
        assert_eq!(report.winner, None);
    }

    #[test]
    fn values_round_to_two_decimals() {
        let reporter = reporter(&["a", "b", "c", "d"]);
        let report = reporter.report(&ProbabilityVector::from(vec![0.2, 0.8, 0.75, 0.1234]), 0.5);
        let shown: Vec<String> = report.readings.iter().map(ClassReading::display_value).collect();
        assert_eq!(shown, vec!["0.20", "0.80", "0.75", "0.12"]);
        assert_eq!(report.winner, Some(1));
        assert!(!report.readings[3].active);
    }
}
