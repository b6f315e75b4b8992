//! Word-count constraints for simulated student messages.

use crate::error::CoreError;
use std::str::FromStr;

/// Length text used when a problem has no reference queries.
pub const DEFAULT_LENGTH_TEXT: &str = "around 20 words";

/// How reference query lengths are summarised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthControlMode {
    Range,
    Average,
}

impl FromStr for LengthControlMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "range" => Ok(LengthControlMode::Range),
            "average" => Ok(LengthControlMode::Average),
            _ => Err(CoreError::UnsupportedLengthMode(s.to_string())),
        }
    }
}

pub fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Never returns less than 1.
pub fn round_down_to_nearest_5(n: usize) -> usize {
    ((n / 5) * 5).max(1)
}

/// Never returns less than 1.
pub fn round_up_to_nearest_5(n: f64) -> usize {
    if n <= 0.0 {
        return 1;
    }
    (((n + 4.0) / 5.0).floor() * 5.0) as usize
}

/// Describes the expected message length from a conversation's reference
/// queries. Only the first `problem_turns` queries count when it is positive.
///
/// Returns `None` when there is nothing to measure.
pub fn describe(queries: &[String], problem_turns: i64, mode: LengthControlMode) -> Option<String> {
    let take = usize::try_from(problem_turns)
        .ok()
        .filter(|&n| n > 0)
        .unwrap_or(queries.len());
    let lengths: Vec<usize> = queries.iter().take(take).map(|q| count_words(q)).collect();
    let min = *lengths.iter().min()?;
    let max = *lengths.iter().max()?;

    Some(match mode {
        LengthControlMode::Range => format!(
            "between {} and {} words",
            round_down_to_nearest_5(min),
            round_up_to_nearest_5(max as f64)
        ),
        LengthControlMode::Average => {
            let average = lengths.iter().sum::<usize>() as f64 / lengths.len() as f64;
            format!("around {} words", round_up_to_nearest_5(average))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queries(texts: &[&str]) -> Vec<String> {
        texts.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("range".parse::<LengthControlMode>().unwrap(), LengthControlMode::Range);
        assert_eq!(" Average".parse::<LengthControlMode>().unwrap(), LengthControlMode::Average);
        let err = "median".parse::<LengthControlMode>().unwrap_err();
        assert!(matches!(err, CoreError::UnsupportedLengthMode(m) if m == "median"));
    }

    #[test]
    fn test_rounding_helpers() {
        assert_eq!(round_down_to_nearest_5(0), 1);
        assert_eq!(round_down_to_nearest_5(4), 1);
        assert_eq!(round_down_to_nearest_5(12), 10);
        assert_eq!(round_up_to_nearest_5(0.0), 1);
        assert_eq!(round_up_to_nearest_5(11.0), 15);
        assert_eq!(round_up_to_nearest_5(15.0), 15);
        assert_eq!(round_up_to_nearest_5(12.3), 15);
    }

    #[test]
    fn test_count_words_ignores_extra_whitespace() {
        assert_eq!(count_words("  how   do I\tstart?\n"), 4);
        assert_eq!(count_words(""), 0);
    }

    #[test]
    fn test_describe_range_and_average() {
        let qs = queries(&["one two three", "one two three four five six seven", "a b c d e f g h i j k l"]);
        assert_eq!(
            describe(&qs, -1, LengthControlMode::Range).as_deref(),
            Some("between 1 and 15 words")
        );
        assert_eq!(
            describe(&qs, 2, LengthControlMode::Range).as_deref(),
            Some("between 1 and 10 words")
        );
        assert_eq!(
            describe(&qs, 0, LengthControlMode::Average).as_deref(),
            Some("around 10 words")
        );
        assert_eq!(describe(&[], -1, LengthControlMode::Average), None);
    }
}
