//! The build steps, in the order the builder runs them.
//!
//! Each step acquires or creates one remote resource, records what it
//! produced in the state container, and undoes its own work in cleanup.

pub mod copy_image;
pub mod create_image;
pub mod detach_key_pair;
pub mod instance;
pub mod key_pair;
pub mod network;
pub mod pre_validate;
pub mod provision;
pub mod share_image;
pub mod source_image;

pub use copy_image::StepCopyImage;
pub use create_image::StepCreateImage;
pub use detach_key_pair::StepDetachTempKeyPair;
pub use instance::StepRunInstance;
pub use key_pair::StepConfigKeyPair;
pub use network::{StepConfigSecurityGroup, StepConfigSubnet, StepConfigVpc};
pub use pre_validate::StepPreValidate;
pub use provision::StepProvision;
pub use share_image::StepShareImage;
pub use source_image::StepCheckSourceImage;
