pub mod shdlc;
pub mod sps30;

#[cfg(test)]
pub mod mock;

pub use shdlc::{ShdlcChannel, ShdlcError, ShdlcPort};
pub use sps30::{DeviceStatus, MeasuredValues, Sps30, VersionInfo, SPS30_PRODUCT_TYPE};
