use std::borrow::Cow;

use thiserror::Error;

pub mod crd;
pub mod key;
pub mod labels;
pub mod profile;
pub mod server;

#[derive(Debug, Error)]
pub enum ResourceGenerationError {
    #[error("Resource contains invalid data ({})!", .0)]
    InvalidData(Cow<'static, str>),
    #[error("Resource is missing required data ({})!", .0)]
    MissingData(Cow<'static, str>),
    #[error("Provided dependent resource is missing a name!")]
    DependentMissingMetadataName,
    #[error("Provided dependent resource is missing a namespace!")]
    DependentMissingMetadataNamespace,
    #[error("Provided dependent resource is missing data ({})!", .0)]
    DependentMissingData(Cow<'static, str>),
    #[error("Provided dependent resource contains invalid data ({})!", .0)]
    DependentInvalidData(Cow<'static, str>),
}
