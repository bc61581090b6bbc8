/// Cryptographic utilities
pub mod crypto_utils;
/// Logging macros
#[macro_use]
#[allow(missing_docs)]
pub mod macro_logger;
/// Debugging
#[macro_use]
pub mod debug_utils;
/// Loopback counterparties
#[cfg(feature = "test_utils")]
pub mod loopback;
/// Serialization helpers
pub mod ser_util;
/// Error status
pub mod status;
/// Test utilities
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
/// Transaction assembly and signing helpers
pub mod transaction_utils;
