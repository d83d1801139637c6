//! Panic recovery for user code.
//!
//! Functions, duties, sources, recycle callbacks, governance and flow
//! callbacks all run through [`with_recovery`]. A panic becomes a
//! [`PanicEscalation`] cause so it travels the escalation path like any other
//! failure instead of unwinding through kernel state.

use std::panic::{catch_unwind, AssertUnwindSafe};

use super::escalation::PanicEscalation;
use crate::types::BoxError;

/// Execute user code with panic recovery.
///
/// # Example
/// ```
/// use office_kernel::kernel::with_recovery;
///
/// let result = with_recovery(|| Ok(42), "my_operation");
/// assert_eq!(result.unwrap(), 42);
/// ```
pub fn with_recovery<F, T>(operation: F, operation_name: &str) -> Result<T, BoxError>
where
    F: FnOnce() -> Result<T, BoxError>,
{
    match catch_unwind(AssertUnwindSafe(operation)) {
        Ok(result) => result,
        Err(panic_payload) => {
            let panic_msg = extract_panic_message(&panic_payload);
            tracing::error!(
                "panic_recovered: operation={}, panic={}",
                operation_name,
                panic_msg
            );

            Err(Box::new(PanicEscalation {
                operation: operation_name.to_string(),
                message: panic_msg,
            }))
        }
    }
}

/// Extract panic message from panic payload.
fn extract_panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic (no message)".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_recovery_success() {
        let result = with_recovery(|| Ok(42), "test_operation");
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn test_with_recovery_preserves_error() {
        let result: Result<(), BoxError> =
            with_recovery(|| Err("specific failure".into()), "test_operation");
        assert_eq!(result.unwrap_err().to_string(), "specific failure");
    }

    #[test]
    fn test_with_recovery_panic_becomes_escalation_cause() {
        let result: Result<(), BoxError> = with_recovery(
            || {
                panic!("test panic");
            },
            "function 'task'",
        );

        let err = result.unwrap_err();
        let panic = err.downcast_ref::<PanicEscalation>().unwrap();
        assert_eq!(panic.operation, "function 'task'");
        assert_eq!(panic.message, "test panic");
    }

    #[test]
    fn test_extract_panic_message_string() {
        let panic_result = std::panic::catch_unwind(|| {
            panic!("{}", "formatted message");
        });

        match panic_result {
            Err(payload) => {
                let msg = extract_panic_message(&payload);
                assert!(msg.contains("formatted message"));
            }
            Ok(_) => panic!("Expected panic"),
        }
    }
}
