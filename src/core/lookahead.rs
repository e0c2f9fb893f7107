//! ER-008: Lookahead controller: bounded, single-level speculation.
//!
//! A window is opened with a budget of leaf-record steps. Each leaf record
//! executed inside the window consumes one step; once the budget is spent,
//! further actions are skipped rather than failing, so a condition evaluated
//! afterwards sees whatever the consumed records bound. Leaving the window
//! always discards the speculative state.

use super::error::{EngineError, Result};
use super::overlay::Speculate;
use tracing::debug;

/// Kind of action asking whether it may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Record reads (and the body of a TAB1/TAB2/LIST) consume budget.
    Leaf,
    /// Control-flow nodes only check the budget.
    Control,
}

#[derive(Debug, Clone, Default)]
pub struct Lookahead {
    remaining: Option<usize>,
}

impl Lookahead {
    pub fn new() -> Lookahead {
        Lookahead::default()
    }

    /// Open a window of `steps` leaf steps and fork `state`.
    pub fn enter(&mut self, steps: i64, state: &mut impl Speculate) -> Result<()> {
        if self.remaining.is_some() {
            return Err(EngineError::NestedLookahead);
        }
        let steps = usize::try_from(steps).map_err(|_| {
            EngineError::InvalidRecipe(format!("lookahead step count {} is negative", steps))
        })?;
        debug!(steps, "enter lookahead");
        state.fork();
        self.remaining = Some(steps);
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.remaining.is_some()
    }

    /// Budget spent; remaining actions of the window are no-ops.
    pub fn is_exhausted(&self) -> bool {
        self.remaining == Some(0)
    }

    /// Whether an action may run, consuming a step for leaf actions.
    /// Outside a window every action runs.
    pub fn proceed(&mut self, step: Step) -> bool {
        match self.remaining.as_mut() {
            None => true,
            Some(0) => false,
            Some(n) => {
                if step == Step::Leaf {
                    *n -= 1;
                }
                true
            }
        }
    }

    /// Close the window and drop everything written inside it.
    pub fn leave(&mut self, state: &mut impl Speculate) {
        debug!(remaining = ?self.remaining, "leave lookahead");
        state.discard();
        self.remaining = None;
    }
}
