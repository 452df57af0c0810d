//! Host to container bind-mount declarations.
//!
//! Bindings are collected in declaration order and validated as a whole
//! before anything is handed to the backend: a single invalid binding aborts
//! the run with no partial mount state applied.

use std::collections::HashSet;
use std::path::Path;

use tracing::{debug, error, instrument, trace};

use crate::error::BindingError;

/// A host path (or identifier) made visible inside the container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Binding {
    /// Host path or identifier.
    pub source: String,
    /// Path inside the container.
    pub destination: String,
    /// Mount read-only.
    pub read_only: bool,
    /// Pass through as a device node instead of a volume.
    pub device: bool,
}

impl Binding {
    /// Creates a read-write volume binding from `source` to `destination`.
    #[must_use]
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            read_only: false,
            device: false,
        }
    }

    /// Creates a binding whose destination equals its source.
    #[must_use]
    pub fn same(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_string_lossy().into_owned();
        Self::new(path.clone(), path)
    }

    /// Marks the binding read-only.
    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Marks the binding as a device node.
    #[must_use]
    pub fn device(mut self) -> Self {
        self.device = true;
        self
    }

    /// Renders the binding as a container CLI option.
    #[must_use]
    pub fn to_cli_option(&self) -> String {
        if self.device {
            format!("--device={}:{}", self.source, self.destination)
        } else if self.read_only {
            format!("--volume={}:{}:ro", self.source, self.destination)
        } else {
            format!("--volume={}:{}", self.source, self.destination)
        }
    }
}

/// Ordered collection of [`Binding`]s.
#[derive(Debug, Clone, Default)]
pub struct BindingSet {
    bindings: Vec<Binding>,
}

impl BindingSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a binding. `destination` defaults to `source`.
    pub fn add(
        &mut self,
        source: impl AsRef<Path>,
        destination: Option<&str>,
        read_only: bool,
        device: bool,
    ) {
        let source = source.as_ref().to_string_lossy().into_owned();
        let destination = destination.map_or_else(|| source.clone(), str::to_string);
        trace!(%source, %destination, read_only, device, "Adding binding");
        self.push(Binding {
            source,
            destination,
            read_only,
            device,
        });
    }

    /// Appends an already built binding.
    pub fn push(&mut self, binding: Binding) {
        self.bindings.push(binding);
    }

    /// Checks that sources and destinations are pairwise distinct.
    ///
    /// Bindings are scanned in declaration order. For each binding the
    /// source is checked before the destination, so the reported error is
    /// deterministic when both collide.
    ///
    /// # Errors
    ///
    /// Returns `BindingError::DuplicateSource` or
    /// `BindingError::DuplicateDestination` for the first offending binding.
    #[instrument(skip(self), fields(count = self.bindings.len()))]
    pub fn validate(&self) -> Result<(), BindingError> {
        let mut sources = HashSet::new();
        let mut destinations = HashSet::new();

        for binding in &self.bindings {
            if !sources.insert(binding.source.as_str()) {
                error!(source = %binding.source, "Duplicated mount source");
                return Err(BindingError::DuplicateSource {
                    path: binding.source.clone(),
                });
            }
            if !destinations.insert(binding.destination.as_str()) {
                error!(destination = %binding.destination, "Duplicated mount destination");
                return Err(BindingError::DuplicateDestination {
                    path: binding.destination.clone(),
                });
            }
        }

        debug!("Bindings validated");
        Ok(())
    }

    /// Returns true if a binding with this source exists.
    #[must_use]
    pub fn contains_source(&self, source: &str) -> bool {
        self.bindings.iter().any(|b| b.source == source)
    }

    /// Returns the bindings in declaration order.
    #[must_use]
    pub fn as_slice(&self) -> &[Binding] {
        &self.bindings
    }

    /// Returns the last declared binding.
    #[must_use]
    pub fn last(&self) -> Option<&Binding> {
        self.bindings.last()
    }

    /// Number of bindings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Returns true if no binding was declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Binding> {
        self.bindings.iter()
    }
}

impl<'a> IntoIterator for &'a BindingSet {
    type Item = &'a Binding;
    type IntoIter = std::slice::Iter<'a, Binding>;

    fn into_iter(self) -> Self::IntoIter {
        self.bindings.iter()
    }
}
