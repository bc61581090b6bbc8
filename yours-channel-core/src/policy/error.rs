#[cfg(feature = "use_backtrace")]
use backtrace::Backtrace;

use ValidationErrorKind::*;

use crate::prelude::*;

/// Kind of validation error
#[derive(Clone, Debug, PartialEq)]
pub enum ValidationErrorKind {
    /// A script could not be parsed or was not one of the channel templates
    ScriptFormat(String),
    /// A transaction or script element didn't match the channel state
    Mismatch(String),
    /// A policy was violated
    Policy(String),
}

// Explicit PartialEq which ignores backtrace.
impl PartialEq for ValidationError {
    fn eq(&self, other: &ValidationError) -> bool {
        self.kind == other.kind
    }
}

/// Validation error
#[derive(Clone)]
pub struct ValidationError {
    /// The kind of error
    pub kind: ValidationErrorKind,
    /// A non-resolved backtrace
    #[cfg(feature = "use_backtrace")]
    pub bt: Backtrace,
}

impl ValidationError {
    /// Resolve the backtrace for display to the user
    #[cfg(feature = "use_backtrace")]
    pub fn resolved_backtrace(&self) -> Backtrace {
        let mut mve = self.clone();
        mve.bt.resolve();
        mve.bt
    }
}

impl core::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "{:?}", self.kind)
    }
}

impl core::fmt::Debug for ValidationError {
    #[cfg(not(feature = "use_backtrace"))]
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("ValidationError").field("kind", &self.kind).finish()
    }
    #[cfg(feature = "use_backtrace")]
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("ValidationError")
            .field("kind", &self.kind)
            .field("bt", &self.resolved_backtrace())
            .finish()
    }
}

impl Into<String> for ValidationError {
    fn into(self) -> String {
        match self.kind {
            ScriptFormat(s) => "script format: ".to_string() + &s,
            Mismatch(s) => "template mismatch: ".to_string() + &s,
            Policy(s) => "policy failure: ".to_string() + &s,
        }
    }
}

pub(crate) fn script_format_error(msg: impl Into<String>) -> ValidationError {
    ValidationError {
        kind: ScriptFormat(msg.into()),
        #[cfg(feature = "use_backtrace")]
        bt: Backtrace::new_unresolved(),
    }
}

pub(crate) fn mismatch_error(msg: impl Into<String>) -> ValidationError {
    ValidationError {
        kind: Mismatch(msg.into()),
        #[cfg(feature = "use_backtrace")]
        bt: Backtrace::new_unresolved(),
    }
}

pub(crate) fn policy_error(msg: impl Into<String>) -> ValidationError {
    ValidationError {
        kind: Policy(msg.into()),
        #[cfg(feature = "use_backtrace")]
        bt: Backtrace::new_unresolved(),
    }
}

/// Return a policy error from the current function, by invoking
/// policy_error on the policy object.
#[doc(hidden)]
#[macro_export]
#[allow(unused)]
macro_rules! policy_err {
	($obj:expr, $tag:tt, $($arg:tt)*) => (
        $obj.policy().policy_error($tag.into(), format!(
            "{}: {}",
            short_function!(),
            format!($($arg)*)
        ))?
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_test() {
        assert_eq!(
            format!("{}", script_format_error("testing".to_string())),
            "ScriptFormat(\"testing\")"
        );
        assert_eq!(
            Into::<String>::into(script_format_error("testing".to_string())),
            "script format: testing"
        );
        assert_eq!(format!("{}", mismatch_error("testing".to_string())), "Mismatch(\"testing\")");
        assert_eq!(
            Into::<String>::into(mismatch_error("testing".to_string())),
            "template mismatch: testing"
        );
        assert_eq!(
            Into::<String>::into(policy_error("testing".to_string())),
            "policy failure: testing"
        );
    }

    #[test]
    fn errors_ignore_backtrace_test() {
        assert_eq!(mismatch_error("htlc hash"), mismatch_error("htlc hash"));
        assert_ne!(mismatch_error("htlc hash"), policy_error("htlc hash"));
    }
}
