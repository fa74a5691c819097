//! Ordered fallback over several providers.

use std::sync::Arc;

use async_trait::async_trait;

use a3s_oci_core::{Descriptor, OciError, Result};

use super::{Provider, ReaderAt};

/// Provider trying each member in order.
///
/// A `NotFound` from one member falls through to the next; any other error
/// stops the search. Put local sources before remote ones.
#[derive(Clone, Default)]
pub struct MultiProvider {
    providers: Vec<Arc<dyn Provider>>,
}

impl MultiProvider {
    pub fn new(providers: Vec<Arc<dyn Provider>>) -> Self {
        Self { providers }
    }

    /// Append a lower-priority provider.
    pub fn push(&mut self, provider: Arc<dyn Provider>) {
        self.providers.push(provider);
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[async_trait]
impl Provider for MultiProvider {
    async fn reader_at(&self, desc: &Descriptor) -> Result<Box<dyn ReaderAt>> {
        for (position, provider) in self.providers.iter().enumerate() {
            match provider.reader_at(desc).await {
                Ok(reader) => return Ok(reader),
                Err(e) if e.is_not_found() => {
                    tracing::trace!(digest = %desc.digest, position, "Not in provider, trying next");
                }
                Err(e) => return Err(e),
            }
        }
        Err(OciError::NotFound(format!(
            "{} not found in any of {} providers",
            desc.digest,
            self.providers.len()
        )))
    }
}
