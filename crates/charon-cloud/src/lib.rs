//! charon-cloud
//!
//! Typed client for the upstream GPU cloud: the `CloudProvider` trait, the
//! HTTP implementation against the Lambda-style REST API, and an
//! in-process `LocalCloud` for tests and development.

pub mod lambda;
pub mod local;
pub mod provider;
pub mod types;

pub use lambda::{ApiKeySource, LambdaCloud, StaticApiKey};
pub use local::LocalCloud;
pub use provider::{CloudError, CloudProvider, CloudResult};
pub use types::{FilesystemInfo, InstanceInfo, InstanceTypeInfo, LaunchSpec, SshKeyInfo};
