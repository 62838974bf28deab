//! Operator configuration
//!
//! The desired state comes from two read-only inputs: the install config
//! stored in the cluster and the image manifest shipped with the operator.

pub mod images;
pub mod operator;
mod resolver;

pub use images::ImageMapping;
pub use operator::{AwsConfig, LibvirtConfig, OperatorConfig, Provider};
pub use resolver::ConfigResolver;
