use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use flowgraph_core::error::{FlowError, Result};

/// Bounded integer range cursor with arm-then-advance semantics.
///
/// Built from `"start:end:step"` or `"start...end"` (step 1). The range is
/// half-open: `end` itself is never produced. The first [`Stepper::next`]
/// arms the cursor at `start`; each later call moves it by `step` and fails
/// with [`FlowError::StepperExhausted`] once the move would reach `end`,
/// leaving `current` at its last valid value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stepper {
    start: i64,
    end: i64,
    step: i64,
    current: i64,
    started: bool,
}

impl Stepper {
    pub fn new(start: i64, end: i64, step: i64) -> Result<Self> {
        if step <= 0 {
            return Err(FlowError::InvalidStepper(format!(
                "step must be positive, got {}",
                step
            )));
        }
        Ok(Self {
            start,
            end,
            step,
            current: start,
            started: false,
        })
    }

    /// Parse a range specification.
    #[allow(clippy::should_implement_trait)]
    pub fn from(spec: &str) -> Result<Self> {
        let spec = spec.trim();

        let (start, end, step) = if let Some((start, end)) = spec.split_once("...") {
            (parse_bound(spec, start)?, parse_bound(spec, end)?, 1)
        } else {
            let parts: Vec<&str> = spec.split(':').collect();
            match parts.as_slice() {
                [start, end] => (parse_bound(spec, start)?, parse_bound(spec, end)?, 1),
                [start, end, step] => (
                    parse_bound(spec, start)?,
                    parse_bound(spec, end)?,
                    parse_bound(spec, step)?,
                ),
                _ => {
                    return Err(FlowError::InvalidStepper(format!(
                        "expected 'start:end:step' or 'start...end', got '{}'",
                        spec
                    )))
                }
            }
        };

        Self::new(start, end, step)
    }

    /// Arm the cursor, or advance it by one step.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<i64> {
        if !self.started {
            if self.start >= self.end {
                return Err(FlowError::StepperExhausted(self.to_string()));
            }
            self.started = true;
            return Ok(self.current);
        }

        match self.current.checked_add(self.step) {
            Some(next) if next < self.end => {
                self.current = next;
                Ok(next)
            }
            _ => Err(FlowError::StepperExhausted(self.to_string())),
        }
    }

    /// Whether another call to `next` would succeed.
    pub fn has_next(&self) -> bool {
        if !self.started {
            return self.start < self.end;
        }
        self.current
            .checked_add(self.step)
            .is_some_and(|next| next < self.end)
    }

    /// Every value of the range, from a fresh (unarmed) copy.
    pub fn values(&self) -> impl Iterator<Item = i64> {
        let mut fresh = Self {
            current: self.start,
            started: false,
            ..self.clone()
        };
        std::iter::from_fn(move || fresh.next().ok())
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn end(&self) -> i64 {
        self.end
    }

    pub fn step(&self) -> i64 {
        self.step
    }

    pub fn current(&self) -> i64 {
        self.current
    }

    pub fn is_started(&self) -> bool {
        self.started
    }
}

fn parse_bound(spec: &str, raw: &str) -> Result<i64> {
    raw.trim().parse::<i64>().map_err(|_| {
        FlowError::InvalidStepper(format!("'{}' is not an integer in '{}'", raw.trim(), spec))
    })
}

impl FromStr for Stepper {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self> {
        Stepper::from(s)
    }
}

impl fmt::Display for Stepper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{start={},end={},step={},current={}}}",
            self.start, self.end, self.step, self.current
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arm_then_advance() {
        let mut s = Stepper::from("1:3:1").unwrap();
        assert_eq!(s.to_string(), "{start=1,end=3,step=1,current=1}");

        assert_eq!(s.next().unwrap(), 1);
        assert_eq!(s.to_string(), "{start=1,end=3,step=1,current=1}");

        assert_eq!(s.next().unwrap(), 2);
        assert_eq!(s.current(), 2);

        let err = s.next().unwrap_err();
        assert!(matches!(err, FlowError::StepperExhausted(_)));
        assert_eq!(s.current(), 2);
        // Stays exhausted.
        assert!(s.next().is_err());
        assert_eq!(s.current(), 2);
    }

    #[test]
    fn test_ellipsis_form() {
        let s = Stepper::from("1...5").unwrap();
        assert_eq!(s.step(), 1);
        assert_eq!(s.values().collect::<Vec<_>>(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_custom_step() {
        let s: Stepper = "0:10:3".parse().unwrap();
        assert_eq!(s.values().collect::<Vec<_>>(), vec![0, 3, 6, 9]);
    }

    #[test]
    fn test_negative_bounds() {
        let s = Stepper::from("-2...1").unwrap();
        assert_eq!(s.values().collect::<Vec<_>>(), vec![-2, -1, 0]);
    }

    #[test]
    fn test_empty_range_fails_to_arm() {
        let mut s = Stepper::from("3:3:1").unwrap();
        assert!(!s.has_next());
        assert!(s.next().is_err());
        assert!(!s.is_started());
        assert_eq!(s.values().count(), 0);
    }

    #[test]
    fn test_has_next_tracks_next() {
        let mut s = Stepper::from("1:3:1").unwrap();
        assert!(s.has_next());
        s.next().unwrap();
        assert!(s.has_next());
        s.next().unwrap();
        assert!(!s.has_next());
    }

    #[test]
    fn test_values_ignores_progress() {
        let mut s = Stepper::from("1:4:1").unwrap();
        s.next().unwrap();
        s.next().unwrap();
        assert_eq!(s.values().collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_invalid_specs() {
        for spec in ["", "1", "a:3", "1:2:3:4", "1:5:0", "1:5:-1", "x...3"] {
            let err = Stepper::from(spec).unwrap_err();
            assert!(
                matches!(err, FlowError::InvalidStepper(_)),
                "spec {:?} gave {:?}",
                spec,
                err
            );
        }
    }

    #[test]
    fn test_overflow_is_exhaustion() {
        let mut s = Stepper::new(i64::MAX - 1, i64::MAX, 5).unwrap();
        assert_eq!(s.next().unwrap(), i64::MAX - 1);
        assert!(s.next().is_err());
    }
}
