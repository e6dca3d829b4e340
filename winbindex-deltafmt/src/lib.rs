mod error;
pub use self::error::Error;

pub mod delta_descriptor;
pub use delta_descriptor::{DeltaDescriptor, DeltaDescriptorInfo};

pub mod pe;
pub use pe::{PeHeader, PeMetadata, SigningInfo};
