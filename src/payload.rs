//! Shape checks for free-text and numeric action payloads. Text is trimmed before measuring.
use chrono::NaiveDate;

use crate::error::{Error, Result};
use crate::types::DueDate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextRule {
    pub label: &'static str,
    pub min: usize,
    pub max: Option<usize>,
}

impl TextRule {
    pub const fn new(label: &'static str, min: usize, max: Option<usize>) -> Self {
        Self { label, min, max }
    }

    /// Returns the trimmed text when it fits the rule.
    pub fn check(&self, raw: &str) -> Result<String> {
        let text = raw.trim();
        let len = text.chars().count();
        if len == 0 {
            return Err(Error::validation(format!("{} cannot be blank.", self.label)));
        }
        if len < self.min {
            return Err(Error::validation(format!(
                "{} must be at least {} characters.",
                self.label, self.min
            )));
        }
        if let Some(max) = self.max {
            if len > max {
                return Err(Error::validation(format!(
                    "{} must be at most {max} characters.",
                    self.label
                )));
            }
        }
        Ok(text.to_string())
    }
}

pub const INCIDENT_REASON: TextRule = TextRule::new("Reason", 1, Some(500));
pub const MEASURE_REASON: TextRule = TextRule::new("Reason", 10, Some(1000));
pub const EVIDENCE: TextRule = TextRule::new("Evidence", 10, Some(2000));
pub const CLOSURE_COMMENT: TextRule = TextRule::new("Closure comment", 10, Some(2000));
pub const MEASURE_COMMENT: TextRule = TextRule::new("Comment", 1, Some(1000));
pub const RISK_REASON: TextRule = TextRule::new("Reason", 20, None);
pub const RISK_COMMENT: TextRule = TextRule::new("Comment", 1, None);
pub const TITLE: TextRule = TextRule::new("Title", 1, Some(255));
pub const DESCRIPTION: TextRule = TextRule::new("Description", 1, None);

/// Likelihood, impact and effectiveness ratings live on a 1..=5 scale.
pub fn score(name: &str, value: u8) -> Result<()> {
    if (1..=5).contains(&value) {
        return Ok(());
    }
    Err(Error::validation(format!("{name} must be between 1 and 5, got {value}.")))
}

pub fn deadline(deadline: DueDate, today: NaiveDate) -> Result<()> {
    if deadline.date() < today {
        return Err(Error::validation("Deadline cannot be in the past."));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_is_trimmed_before_measuring() {
        assert_eq!(
            MEASURE_REASON.check("   too short  ").unwrap_err().to_string(),
            "Reason must be at least 10 characters."
        );
        assert_eq!(MEASURE_REASON.check("  long enough reason ").unwrap(), "long enough reason");
        assert_eq!(
            INCIDENT_REASON.check("   ").unwrap_err().to_string(),
            "Reason cannot be blank."
        );
    }

    #[test]
    fn upper_bounds_count_characters() {
        let text = "é".repeat(500);
        assert!(INCIDENT_REASON.check(&text).is_ok());
        let text = "é".repeat(501);
        assert!(INCIDENT_REASON.check(&text).is_err());
    }

    #[test]
    fn scores_and_deadlines() {
        assert!(score("inherent_likelihood", 5).is_ok());
        assert!(score("inherent_likelihood", 0).is_err());
        assert!(score("inherent_likelihood", 6).is_err());

        let today = NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();
        assert!(deadline(DueDate::new(today), today).is_ok());
        assert!(deadline(DueDate::new(today.pred_opt().unwrap()), today).is_err());
    }
}
