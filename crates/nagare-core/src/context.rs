//! Append-only workflow context keyed by step name.

use crate::error::{StepError, WorkflowError};
use crate::step::StepName;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// A type-erased step result.
///
/// Keeps a `Debug` rendering of the value so reports can show what a step
/// produced without knowing its type.
#[derive(Clone)]
pub struct StepValue {
    value: Arc<dyn Any + Send + Sync>,
    summary: String,
}

impl StepValue {
    /// Wraps a value produced by a step.
    pub fn new<T: Any + Send + Sync + fmt::Debug>(value: T) -> Self {
        let summary = format!("{:?}", value);
        Self {
            value: Arc::new(value),
            summary,
        }
    }

    /// A value for steps that produce nothing of interest.
    pub fn unit() -> Self {
        Self::new(())
    }

    /// Returns a reference to the inner value if it has type `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Returns `true` if the inner value has type `T`.
    pub fn is<T: Any>(&self) -> bool {
        self.value.is::<T>()
    }

    /// Debug rendering of the inner value.
    pub fn summary(&self) -> &str {
        &self.summary
    }
}

impl fmt::Debug for StepValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary)
    }
}

/// Accumulated results of a workflow run.
///
/// Each completed step's value is recorded under the step's name, in
/// completion order. Entries are never replaced or removed.
///
/// # Examples
///
/// ```
/// use nagare_core::{Context, StepName, StepValue};
///
/// let mut ctx = Context::new();
/// ctx.record(StepName::new("create_source"), StepValue::new("src".to_string()))
///     .expect("first write");
///
/// assert_eq!(ctx.get::<String>("create_source"), Some(&"src".to_string()));
/// // Wrong type returns None
/// assert_eq!(ctx.get::<u64>("create_source"), None);
/// // Second write under the same name is rejected
/// assert!(ctx.record(StepName::new("create_source"), StepValue::unit()).is_err());
/// ```
#[derive(Clone)]
pub struct Context {
    data: HashMap<StepName, StepValue>,
    order: Vec<StepName>,
    started_at: Instant,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("steps", &self.order)
            .field("started_at", &self.started_at)
            .finish()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// Creates a new empty context.
    pub fn new() -> Self {
        Self {
            data: HashMap::new(),
            order: Vec::new(),
            started_at: Instant::now(),
        }
    }

    /// Records a step result.
    ///
    /// Fails if a result is already recorded under `name`.
    pub fn record(&mut self, name: StepName, value: StepValue) -> Result<(), WorkflowError> {
        if self.data.contains_key(&name) {
            return Err(WorkflowError::Configuration(format!(
                "result for step '{}' already recorded",
                name
            )));
        }
        self.order.push(name.clone());
        self.data.insert(name, value);
        Ok(())
    }

    /// Returns the result of the named step if it exists and has type `T`.
    pub fn get<T: Any>(&self, step: &str) -> Option<&T> {
        self.data.get(step).and_then(|v| v.downcast_ref::<T>())
    }

    /// Like [`Context::get`], but reports a missing input as a permanent
    /// invalid-input error so steps can use `?`.
    pub fn require<T: Any>(&self, step: &str) -> Result<&T, StepError> {
        match self.data.get(step) {
            Some(value) => value.downcast_ref::<T>().ok_or_else(|| {
                StepError::invalid_input(format!(
                    "result of step '{}' has unexpected type: {}",
                    step,
                    value.summary()
                ))
            }),
            None => Err(StepError::invalid_input(format!(
                "no result recorded for step '{}'",
                step
            ))),
        }
    }

    /// Returns the type-erased result of the named step.
    pub fn value(&self, step: &str) -> Option<&StepValue> {
        self.data.get(step)
    }

    /// Returns `true` if the named step has a recorded result.
    pub fn contains(&self, step: &str) -> bool {
        self.data.contains_key(step)
    }

    /// Step names in the order their results were recorded.
    pub fn steps(&self) -> impl Iterator<Item = &StepName> {
        self.order.iter()
    }

    /// Returns the number of recorded results.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns `true` if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Returns the time elapsed since the context was created.
    pub fn elapsed(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heterogeneous_results() {
        let mut ctx = Context::new();

        ctx.record(StepName::new("count"), StepValue::new(42u32))
            .expect("record count");
        ctx.record(StepName::new("name"), StepValue::new("src".to_string()))
            .expect("record name");

        assert_eq!(ctx.get::<u32>("count"), Some(&42));
        assert_eq!(ctx.get::<String>("name"), Some(&"src".to_string()));
        assert_eq!(ctx.get::<String>("count"), None);
    }

    #[test]
    fn test_append_only() {
        let mut ctx = Context::new();
        ctx.record(StepName::new("a"), StepValue::new(1i32))
            .expect("first write");

        let result = ctx.record(StepName::new("a"), StepValue::new(2i32));
        assert!(matches!(result, Err(WorkflowError::Configuration(_))));
        assert_eq!(ctx.get::<i32>("a"), Some(&1));
    }

    #[test]
    fn test_insertion_order() {
        let mut ctx = Context::new();
        for name in ["third", "first", "second"] {
            ctx.record(StepName::new(name), StepValue::unit())
                .expect("record");
        }
        let names: Vec<&str> = ctx.steps().map(|s| s.as_str()).collect();
        assert_eq!(names, vec!["third", "first", "second"]);
        assert_eq!(ctx.len(), 3);
    }

    #[test]
    fn test_require() {
        let mut ctx = Context::new();
        ctx.record(StepName::new("job"), StepValue::new("abc".to_string()))
            .expect("record");

        assert_eq!(ctx.require::<String>("job").map(|s| s.as_str()), Ok("abc"));
        assert!(ctx
            .require::<String>("missing")
            .is_err_and(|e| e.permanent_kind() == Some(crate::PermanentKind::InvalidInput)));
        assert!(ctx.require::<u8>("job").is_err());
    }

    #[test]
    fn test_value_summary() {
        let value = StepValue::new(vec![1, 2, 3]);
        assert_eq!(value.summary(), "[1, 2, 3]");
        assert!(value.is::<Vec<i32>>());
    }
}
