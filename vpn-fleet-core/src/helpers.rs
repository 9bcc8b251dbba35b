use std::{any::type_name, future::Future, time::Duration};

use kube::Resource;
use tokio::time::error::Elapsed;

pub fn pretty_type_name<'a, T>() -> &'a str {
    type_name::<T>().rsplit("::").next().unwrap_or_default()
}

pub trait Invert<TInverted> {
    fn invert(self) -> TInverted;
}

// chaotic evil impl
impl<T, E> Invert<Result<E, T>> for Result<T, E> {
    fn invert(self) -> Result<E, T> {
        match self {
            Ok(ok) => Err(ok),
            Err(err) => Ok(err),
        }
    }
}

pub async fn with_timeout<T, F: Future<Output = T>>(
    timeout: Duration,
    future: F,
) -> Result<T, Elapsed> {
    tokio::time::timeout(timeout, future).await
}

pub trait RequireMetadata<E> {
    fn require_name_or(&self, error: E) -> Result<&str, E>;
    fn require_namespace_or(&self, error: E) -> Result<&str, E>;
}

impl<T: Resource, E> RequireMetadata<E> for T {
    fn require_name_or(&self, error: E) -> Result<&str, E> {
        Ok(self.meta().name.as_ref().ok_or(error)?.as_str())
    }

    fn require_namespace_or(&self, error: E) -> Result<&str, E> {
        Ok(self.meta().namespace.as_ref().ok_or(error)?.as_str())
    }
}
