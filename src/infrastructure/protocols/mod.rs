//! Wire protocols

pub mod sip;
