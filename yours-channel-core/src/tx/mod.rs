/// 2-of-2 funding multisig
pub mod multisig;
/// Channel script templates
pub mod script;
/// Channel transaction types and builders
#[allow(clippy::module_inception)]
pub mod tx;
