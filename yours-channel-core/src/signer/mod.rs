/// Per-channel key derivation
pub mod derive;
