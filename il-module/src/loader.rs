// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::HashMap;

use anyhow::Result;

/// Finds the image of a referenced assembly by its simple name.
pub trait AssemblyResolver {
    /// `Ok(None)` means the assembly could not be found.
    fn resolve(&self, name: &str) -> Result<Option<Box<[u8]>>>;
}

/// Resolver over images that are already in memory.
#[derive(Clone, Debug, Default)]
pub struct MemoryResolver {
    images: HashMap<String, Box<[u8]>>,
}

impl MemoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, image: impl Into<Box<[u8]>>) {
        self.images.insert(name.into(), image.into());
    }
}

impl AssemblyResolver for MemoryResolver {
    fn resolve(&self, name: &str) -> Result<Option<Box<[u8]>>> {
        Ok(self.images.get(name).cloned())
    }
}

/// Caches the images returned by a resolver.
pub struct Loader<R> {
    resolver: R,
    loaded: elsa::sync::FrozenMap<String, Box<[u8]>>,
}

impl<R: AssemblyResolver> Loader<R> {
    pub fn new(resolver: R) -> Self {
        Self {
            resolver,
            loaded: Default::default(),
        }
    }

    /// Load an assembly image, or `None` if the resolver cannot find it.
    pub fn load(&self, name: &str) -> Result<Option<&[u8]>> {
        // Concurrent callers may both resolve a missing entry. The first
        // insert wins and both see the same bytes.
        if let Some(data) = self.loaded.get(name) {
            return Ok(Some(data));
        }

        match self.resolver.resolve(name)? {
            Some(data) => {
                debug!("resolved assembly {}: {} bytes", name, data.len());
                Ok(Some(self.loaded.insert(name.to_owned(), data)))
            }
            None => {
                debug!("unable to resolve assembly {}", name);
                Ok(None)
            }
        }
    }

    pub fn is_resolvable(&self, name: &str) -> Result<bool> {
        Ok(self.load(name)?.is_some())
    }
}
