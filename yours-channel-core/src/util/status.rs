use crate::prelude::*;
use core::fmt;

#[cfg(feature = "use_backtrace")]
use backtrace::Backtrace;
use log::error;

use crate::policy::error::ValidationError;

/// Channel protocol error status
#[derive(Clone, PartialEq, Eq)]
pub struct Status {
    /// The kind of failure
    code: Code,
    /// A relevant error message
    message: String,
}

/// Channel protocol error kind.
///
/// Every kind is recoverable at the protocol layer: the failed handshake step has no
/// effect on the last fully-signed state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Code {
    /// A derivation path is malformed or a segment is out of range
    InvalidPath,
    /// A public key is malformed
    InvalidKey,
    /// Key material could not be derived
    KeyDerivationError,
    /// Amounts violate the funding or balance invariants
    AmountMismatch,
    /// A transaction spends something other than the agreed funding reference
    UnexpectedInput,
    /// A counterparty proposal violates the funding, amount or template invariants
    InvalidProposal,
    /// A signature does not verify against the expected key and output
    SignatureMismatch,
    /// A state update is already outstanding
    UpdateInProgress,
    /// The operation requires `initialize()` to have completed
    NotInitialized,
    /// A previous state must be revoked before a new one is built
    RevocationPending,
}

impl Status {
    /// Create a new `Status` with the associated code and message.
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Status { code, message: message.into() }
    }

    /// Get the `Code` of this `Status`.
    pub fn code(&self) -> Code {
        self.code
    }

    /// Get the text error message of this `Status`.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // A manual impl to reduce the noise of frequently empty fields.
        let mut builder = f.debug_struct("Status");

        builder.field("code", &self.code);

        if !self.message.is_empty() {
            builder.field("message", &self.message);
        }

        builder.finish()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status: {:?}, message: {:?}", self.code(), self.message())
    }
}

impl std::error::Error for Status {}

fn logged(code: Code, label: &str, msg: impl Into<String>) -> Status {
    let s = msg.into();
    error!("{}: {}", label, &s);
    #[cfg(feature = "use_backtrace")]
    error!("BACKTRACE:\n{:?}", Backtrace::new());
    Status::new(code, s)
}

/// A derivation path was malformed
pub fn invalid_path(msg: impl Into<String>) -> Status {
    logged(Code::InvalidPath, "INVALID PATH", msg)
}

/// A public key was malformed
pub fn invalid_key(msg: impl Into<String>) -> Status {
    logged(Code::InvalidKey, "INVALID KEY", msg)
}

/// Key derivation failed
pub fn key_derivation_error(msg: impl Into<String>) -> Status {
    logged(Code::KeyDerivationError, "KEY DERIVATION", msg)
}

/// Amounts did not add up
pub fn amount_mismatch(msg: impl Into<String>) -> Status {
    logged(Code::AmountMismatch, "AMOUNT MISMATCH", msg)
}

/// A transaction input was not the expected one
pub fn unexpected_input(msg: impl Into<String>) -> Status {
    logged(Code::UnexpectedInput, "UNEXPECTED INPUT", msg)
}

/// A counterparty proposal was rejected
pub fn invalid_proposal(msg: impl Into<String>) -> Status {
    logged(Code::InvalidProposal, "INVALID PROPOSAL", msg)
}

/// A signature did not verify
pub fn signature_mismatch(msg: impl Into<String>) -> Status {
    logged(Code::SignatureMismatch, "SIGNATURE MISMATCH", msg)
}

/// An update is already outstanding.
pub fn update_in_progress(msg: impl Into<String>) -> Status {
    // Not a fault, so no backtrace
    let s = msg.into();
    error!("UPDATE IN PROGRESS: {}", &s);
    Status::new(Code::UpdateInProgress, s)
}

/// The instance was used before initialization
pub fn not_initialized(msg: impl Into<String>) -> Status {
    logged(Code::NotInitialized, "NOT INITIALIZED", msg)
}

/// A previous state has not been revoked yet
pub fn revocation_pending(msg: impl Into<String>) -> Status {
    let s = msg.into();
    error!("REVOCATION PENDING: {}", &s);
    Status::new(Code::RevocationPending, s)
}

impl From<ValidationError> for Status {
    fn from(ve: ValidationError) -> Self {
        let s: String = ve.clone().into();
        error!("INVALID PROPOSAL: {}", &s);
        #[cfg(feature = "use_backtrace")]
        error!("BACKTRACE:\n{:?}", &ve.resolved_backtrace());
        Status::new(Code::InvalidProposal, s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::error::policy_error;

    #[test]
    fn status_display_test() {
        let s = amount_mismatch("funding 10 < 20");
        assert_eq!(s.code(), Code::AmountMismatch);
        assert_eq!(format!("{}", s), "status: AmountMismatch, message: \"funding 10 < 20\"");
        assert_eq!(format!("{:?}", Status::new(Code::NotInitialized, "")), "Status { code: NotInitialized }");
    }

    #[test]
    fn validation_error_maps_to_invalid_proposal() {
        let s: Status = policy_error("fee too high").into();
        assert_eq!(s.code(), Code::InvalidProposal);
        assert_eq!(s.message(), "policy failure: fee too high");
    }
}
