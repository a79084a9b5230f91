use std::{
    error::Error,
    fmt::{self, Display},
    ops::Range,
};

/// Why a schedule couldn't be built or resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleErr {
    LengthMismatch { steps: usize, values: usize },
    DuplicateStep(u64),
    MissingStepZero,
    BeforeFirstBreakpoint(u64),
}

impl Display for ScheduleErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleErr::LengthMismatch { steps, values } => {
                write!(f, "schedule has {steps} step(s) but {values} value(s)")
            }
            ScheduleErr::DuplicateStep(step) => write!(f, "schedule repeats step {step}"),
            ScheduleErr::MissingStepZero => f.write_str("schedule has no entry for step 0"),
            ScheduleErr::BeforeFirstBreakpoint(step) => {
                write!(f, "step {step} comes before every schedule breakpoint")
            }
        }
    }
}

impl Error for ScheduleErr {}

/// A piecewise constant hyperparameter, as breakpoints sorted by step.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleTable<T> {
    breakpoints: Vec<(u64, T)>,
}

impl<T: Copy> ScheduleTable<T> {
    /// Creates a new `ScheduleTable` from two index aligned sequences.
    ///
    /// # Arguments
    /// * `steps` - The breakpoint steps, in any order.
    /// * `values` - The value taking effect at each step.
    ///
    /// # Returns
    /// The table or an error if the lengths differ or a step repeats.
    pub fn new(steps: &[u64], values: &[T]) -> Result<Self, ScheduleErr> {
        if steps.len() != values.len() {
            return Err(ScheduleErr::LengthMismatch {
                steps: steps.len(),
                values: values.len(),
            });
        }

        let mut breakpoints: Vec<_> = steps.iter().copied().zip(values.iter().copied()).collect();
        breakpoints.sort_by_key(|(step, _)| *step);

        if let Some(w) = breakpoints.windows(2).find(|w| w[0].0 == w[1].0) {
            return Err(ScheduleErr::DuplicateStep(w[0].0));
        }

        Ok(Self { breakpoints })
    }

    /// Like `new`, but also requires a breakpoint at step 0 so every step resolves.
    pub fn seeded(steps: &[u64], values: &[T]) -> Result<Self, ScheduleErr> {
        let table = Self::new(steps, values)?;

        if !table.starts_at_zero() {
            return Err(ScheduleErr::MissingStepZero);
        }

        Ok(table)
    }

    pub fn starts_at_zero(&self) -> bool {
        self.breakpoints.first().is_some_and(|(step, _)| *step == 0)
    }

    pub fn breakpoints(&self) -> &[(u64, T)] {
        &self.breakpoints
    }

    /// The value of the greatest breakpoint not after `step`.
    ///
    /// # Returns
    /// The active value or `BeforeFirstBreakpoint` if no breakpoint is `<= step`.
    pub fn resolve(&self, step: u64) -> Result<T, ScheduleErr> {
        let idx = self.breakpoints.partition_point(|(s, _)| *s <= step);

        match idx.checked_sub(1) {
            Some(i) => Ok(self.breakpoints[i].1),
            None => Err(ScheduleErr::BeforeFirstBreakpoint(step)),
        }
    }

    /// The value of the last breakpoint inside `steps`, if any falls there.
    ///
    /// With a one step range this is an exact hit on a breakpoint.
    pub fn within(&self, steps: Range<u64>) -> Option<T> {
        let lo = self.breakpoints.partition_point(|(s, _)| *s < steps.start);
        let hi = self.breakpoints.partition_point(|(s, _)| *s < steps.end);

        (hi > lo).then(|| self.breakpoints[hi - 1].1)
    }
}

/// Resolves `table` at `step`, see [`ScheduleTable::resolve`].
pub fn resolve<T: Copy>(table: &ScheduleTable<T>, step: u64) -> Result<T, ScheduleErr> {
    table.resolve(step)
}
