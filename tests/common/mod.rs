//! Shared fixtures for office kernel integration tests.
//!
//! In a test file:
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```

#![allow(dead_code)]

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use office_kernel::kernel::{
    Extension, Governance, Office, OfficeBuilder, ProcessCompletion, RecordingObserver,
};
use office_kernel::types::BoxError;
use serde_json::Value;
use thiserror::Error;

pub const WAIT: Duration = Duration::from_secs(5);

/// Ordered record of user-visible steps, shared between closures.
#[derive(Debug, Clone, Default)]
pub struct Trace(Arc<Mutex<Vec<String>>>);

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, step: impl Into<String>) {
        self.0.lock().unwrap().push(step.into());
    }

    pub fn steps(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn contains(&self, step: &str) -> bool {
        self.0.lock().unwrap().iter().any(|s| s == step)
    }

    pub fn position(&self, step: &str) -> Option<usize> {
        self.0.lock().unwrap().iter().position(|s| s == step)
    }
}

/// Builder with a recording observer already attached.
pub fn observed_builder(name: &str) -> (OfficeBuilder, Arc<RecordingObserver>) {
    let observer = Arc::new(RecordingObserver::new());
    let mut builder = OfficeBuilder::new(name);
    builder.observer(observer.clone());
    (builder, observer)
}

/// Invoke `function` and wait for the completion.
pub fn run(office: &Office, function: &str, parameter: Value) -> ProcessCompletion {
    office
        .function_manager(function)
        .unwrap()
        .invoke_process_and_wait(parameter, WAIT)
        .unwrap()
}

/// Invoke `function` without waiting; the completion arrives on the receiver.
pub fn start(
    office: &Office,
    function: &str,
    parameter: Value,
) -> mpsc::Receiver<ProcessCompletion> {
    let (tx, rx) = mpsc::channel();
    office
        .function_manager(function)
        .unwrap()
        .invoke_process(parameter, move |completion| {
            let _ = tx.send(completion);
        })
        .unwrap();
    rx
}

/// Failure raised by test functions and duties.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("test failure: {0}")]
pub struct TestFailure(pub String);

impl TestFailure {
    pub fn boxed(message: &str) -> BoxError {
        Box::new(TestFailure(message.to_string()))
    }
}

/// Second failure type for handler-matching tests.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("other failure")]
pub struct OtherFailure;

/// Extension interface handed to governance and duties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handle(pub String);

/// Governance that records each call with the handles it received.
#[derive(Debug, Clone)]
pub struct RecordingGovernance {
    pub trace: Trace,
    pub fail_enforce: bool,
}

impl RecordingGovernance {
    pub fn new(trace: &Trace) -> Self {
        Self {
            trace: trace.clone(),
            fail_enforce: false,
        }
    }

    pub fn failing(trace: &Trace) -> Self {
        Self {
            trace: trace.clone(),
            fail_enforce: true,
        }
    }

    fn names(extensions: &[Extension]) -> String {
        extensions
            .iter()
            .filter_map(|e| e.downcast_ref::<Handle>())
            .map(|h| h.0.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl Governance for RecordingGovernance {
    fn enforce(&self, extensions: &[Extension]) -> Result<(), BoxError> {
        self.trace.push(format!("enforce[{}]", Self::names(extensions)));
        if self.fail_enforce {
            return Err(TestFailure::boxed("enforce"));
        }
        Ok(())
    }

    fn disregard(&self, extensions: &[Extension]) -> Result<(), BoxError> {
        self.trace.push(format!("disregard[{}]", Self::names(extensions)));
        Ok(())
    }
}

/// Object with a name, exposing a [`Handle`] extension.
#[derive(Debug)]
pub struct Resource {
    pub name: String,
}
