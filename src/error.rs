use std::any::Any;
use std::backtrace::Backtrace;

use thiserror::Error;

/// Boxed error returned by value creators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A creator panic caught and adapted into an ordinary error.
///
/// Waiters coalesced onto a panicking construction all observe this error
/// instead of unwinding themselves.
#[derive(Debug, Error)]
#[error("{message}\n\n{backtrace}")]
pub struct PanicError {
    /// The panic payload, rendered as text.
    pub message: String,
    /// Stack snapshot taken at the capture site.
    pub backtrace: String,
}

impl PanicError {
    pub(crate) fn new(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "opaque panic payload".to_string()
        };

        let mut backtrace = Backtrace::force_capture().to_string();
        // The first line names this capture site rather than the panicking
        // frame and is stale by the time the error surfaces; drop it.
        if let Some(pos) = backtrace.find('\n') {
            backtrace.drain(..=pos);
        }

        PanicError { message, backtrace }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    fn capture(f: impl FnOnce() + std::panic::UnwindSafe) -> PanicError {
        let payload = catch_unwind(f).expect_err("closure must panic");
        PanicError::new(payload)
    }

    #[test]
    fn str_payload_is_preserved() {
        let prev = std::panic::take_hook();
        std::panic::set_hook(Box::new(|_| {}));
        let err = capture(|| panic!("boom"));
        std::panic::set_hook(prev);
        assert_eq!(err.message, "boom");
        assert!(err.to_string().starts_with("boom\n\n"));
    }

    #[test]
    fn formatted_payload_is_preserved() {
        let prev = std::panic::take_hook();
        std::panic::set_hook(Box::new(|_| {}));
        let n = 7;
        let err = capture(AssertUnwindSafe(move || panic!("bad value {n}")));
        std::panic::set_hook(prev);
        assert_eq!(err.message, "bad value 7");
    }
}
