use crate::prelude::*;
use bitcoin::TxOut;

/// Debug support for bytes
pub struct DebugBytes<'a>(pub &'a [u8]);
impl<'a> core::fmt::Debug for DebugBytes<'a> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> Result<(), core::fmt::Error> {
        for i in self.0 {
            write!(f, "{:02x}", i)?;
        }
        Ok(())
    }
}

/// Debug printer for TxOut which uses a hex encoded script
pub struct DebugTxOut<'a>(pub &'a TxOut);
impl<'a> core::fmt::Debug for DebugTxOut<'a> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> Result<(), core::fmt::Error> {
        f.debug_struct("TxOut")
            .field("value_sat", &self.0.value.to_sat())
            .field("script_pubkey", &DebugBytes(self.0.script_pubkey.as_bytes()))
            .finish()
    }
}

/// Debug support for a list of outputs
pub struct DebugVecTxOut<'a>(pub &'a Vec<TxOut>);
impl<'a> core::fmt::Debug for DebugVecTxOut<'a> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> Result<(), core::fmt::Error> {
        f.debug_list().entries(self.0.iter().map(|vv| DebugTxOut(vv))).finish()
    }
}

/// Placeholder shown instead of secret material
pub struct Redacted;
impl core::fmt::Debug for Redacted {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> Result<(), core::fmt::Error> {
        f.write_str("<redacted>")
    }
}

/// log the channel protocol state at the trace level
#[macro_export]
macro_rules! trace_channel_state {
    ($state: expr) => {
        #[cfg(not(feature = "debug_channel_state"))]
        trace!("{}:\n{:#?}", function!(), $state);
        #[cfg(feature = "debug_channel_state")]
        debug!("{}:\n{:#?}", function!(), $state);
    };
}
