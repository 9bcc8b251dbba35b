use std::fmt::Display;

use kube::Resource;

/// Identity of a server resource, used to serialize work per server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerKey {
    pub namespace: String,
    pub name: String,
}

impl ServerKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_resource<R: Resource>(resource: &R) -> Option<Self> {
        let meta = resource.meta();

        Some(Self::new(meta.namespace.as_ref()?, meta.name.as_ref()?))
    }
}

impl Display for ServerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
