//! Resources loaded through scheme-keyed resolvers.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::provider::{Provider, ResourceResolver};

/// Split `scheme:remaining` into its parts.
///
/// Returns `None` when there is no scheme or it is empty.
pub fn split_scheme(location: &str) -> Option<(&str, &str)> {
    let (scheme, remaining) = location.split_once(':')?;
    if scheme.is_empty() {
        return None;
    }
    Some((scheme, remaining))
}

#[derive(Clone)]
enum Content {
    File(PathBuf),
    Memory(Arc<[u8]>),
}

/// A located resource. Reading is deferred until [`Resource::read`].
#[derive(Clone)]
pub struct Resource {
    scheme: String,
    location: String,
    content: Content,
}

impl Resource {
    pub fn file(location: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            scheme: "file".to_string(),
            location: location.into(),
            content: Content::File(path.into()),
        }
    }

    pub fn memory(
        scheme: impl Into<String>,
        location: impl Into<String>,
        bytes: impl Into<Arc<[u8]>>,
    ) -> Self {
        Self {
            scheme: scheme.into(),
            location: location.into(),
            content: Content::Memory(bytes.into()),
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn exists(&self) -> bool {
        match &self.content {
            Content::File(path) => path.exists(),
            Content::Memory(_) => true,
        }
    }

    pub fn read(&self) -> io::Result<Vec<u8>> {
        match &self.content {
            Content::File(path) => std::fs::read(path),
            Content::Memory(bytes) => Ok(bytes.to_vec()),
        }
    }

    pub fn read_to_string(&self) -> io::Result<String> {
        String::from_utf8(self.read()?).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("scheme", &self.scheme)
            .field("location", &self.location)
            .finish()
    }
}

/// Resolves `file:` locations against the local filesystem.
#[derive(Debug, Default)]
pub struct FileResourceResolver;

impl Provider for FileResourceResolver {
    fn name(&self) -> &str {
        "file"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl ResourceResolver for FileResourceResolver {
    fn scheme(&self) -> &str {
        "file"
    }

    fn resolve(&self, location: &str) -> Option<Resource> {
        if location.is_empty() {
            return None;
        }
        Some(Resource::file(format!("file:{location}"), location))
    }
}

/// Serves resources registered in memory under a configurable scheme.
#[derive(Debug)]
pub struct InMemoryResourceResolver {
    name: String,
    scheme: String,
    entries: RwLock<HashMap<String, Arc<[u8]>>>,
}

impl InMemoryResourceResolver {
    pub fn new(scheme: impl Into<String>) -> Self {
        let scheme = scheme.into();
        Self {
            name: format!("{scheme}-resolver"),
            scheme,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Name the resolver differently from its scheme.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with(self, location: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        self.insert(location, bytes);
        self
    }

    pub fn insert(&self, location: impl Into<String>, bytes: impl Into<Arc<[u8]>>) {
        self.entries.write().insert(location.into(), bytes.into());
    }
}

impl Provider for InMemoryResourceResolver {
    fn name(&self) -> &str {
        &self.name
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl ResourceResolver for InMemoryResourceResolver {
    fn scheme(&self) -> &str {
        &self.scheme
    }

    fn resolve(&self, location: &str) -> Option<Resource> {
        let bytes = self.entries.read().get(location).cloned()?;
        Some(Resource::memory(
            self.scheme.clone(),
            format!("{}:{location}", self.scheme),
            bytes,
        ))
    }
}
