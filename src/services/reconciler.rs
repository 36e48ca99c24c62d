use serde::de::DeserializeOwned;

use crate::error::AppError;
use crate::services::partial_json;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Streaming,
    Final,
}

/// A document the LLM streams as JSON and the service renders as views.
pub trait StreamedDocument: DeserializeOwned + Default {
    type Views: Clone + PartialEq;

    fn render(&self, phase: Phase) -> Self::Views;

    /// Normalisation applied once to the strictly parsed final document.
    fn settle(self) -> Self {
        self
    }
}

/// Turns cumulative buffers into rendered views. Ticks that do not parse, or
/// do not fit the document type, leave the previous views in place; the
/// final strict parse always replaces whatever was shown.
pub struct Reconciler<T: StreamedDocument> {
    views: T::Views,
    ticks: usize,
    applied: usize,
}

impl<T: StreamedDocument> Default for Reconciler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: StreamedDocument> Reconciler<T> {
    pub fn new() -> Self {
        Self {
            views: T::default().render(Phase::Streaming),
            ticks: 0,
            applied: 0,
        }
    }

    pub fn views(&self) -> &T::Views {
        &self.views
    }

    /// Returns the new views when this tick changed them.
    pub fn on_tick(&mut self, buffer: &str) -> Option<&T::Views> {
        self.ticks += 1;
        let value = partial_json::assemble(buffer).ok()?;
        let document: T = match serde_json::from_value(value) {
            Ok(document) => document,
            Err(e) => {
                tracing::trace!("Partial document does not fit yet: {}", e);
                return None;
            }
        };

        let views = document.render(Phase::Streaming);
        if views == self.views {
            return None;
        }
        self.applied += 1;
        self.views = views;
        Some(&self.views)
    }

    /// Strictly parses the complete buffer and renders the final views.
    pub fn finalize(mut self, buffer: &str) -> Result<(T, T::Views), AppError> {
        tracing::debug!(
            "Finalizing after {} ticks ({} rendered)",
            self.ticks,
            self.applied
        );
        let document: T = serde_json::from_str(buffer.trim())?;
        let document = document.settle();
        self.views = document.render(Phase::Final);
        Ok((document, self.views))
    }
}
