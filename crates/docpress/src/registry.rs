//! In-flight conversion registry.
//!
//! Tracks every running conversion by request id so it can be listed and
//! cancelled from outside the task running it. Entries are removed by an
//! RAII guard when the conversion finishes, however it finishes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::backend::DocumentKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionPhase {
    /// Waiting for an instance.
    Acquiring,
    /// Running on an instance.
    Converting,
}

/// Snapshot of one in-flight conversion.
#[derive(Debug, Clone, Serialize)]
pub struct ConversionState {
    pub id: String,
    pub kind: DocumentKind,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub phase: ConversionPhase,
    #[serde(skip)]
    pub started_at: Instant,
    pub elapsed_ms: u64,
    pub cancel_requested: bool,
}

struct ConversionEntry {
    state: ConversionState,
    cancel_token: CancellationToken,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("conversion {0} is already running")]
pub struct DuplicateId(pub String);

#[derive(Default)]
pub struct ConversionRegistry {
    conversions: DashMap<String, ConversionEntry>,
}

impl ConversionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Track a conversion until the returned guard is dropped.
    ///
    /// `cancel_token` is fired by [`cancel`](Self::cancel).
    pub fn register(
        self: &Arc<Self>,
        id: String,
        kind: DocumentKind,
        input_path: PathBuf,
        output_path: PathBuf,
        cancel_token: CancellationToken,
    ) -> Result<RegistrationGuard, DuplicateId> {
        match self.conversions.entry(id.clone()) {
            Entry::Occupied(_) => Err(DuplicateId(id)),
            Entry::Vacant(slot) => {
                slot.insert(ConversionEntry {
                    state: ConversionState {
                        id: id.clone(),
                        kind,
                        input_path,
                        output_path,
                        phase: ConversionPhase::Acquiring,
                        started_at: Instant::now(),
                        elapsed_ms: 0,
                        cancel_requested: false,
                    },
                    cancel_token,
                });
                Ok(RegistrationGuard {
                    id,
                    registry: Arc::clone(self),
                })
            }
        }
    }

    pub fn set_phase(&self, id: &str, phase: ConversionPhase) {
        if let Some(mut entry) = self.conversions.get_mut(id) {
            entry.state.phase = phase;
        }
    }

    /// Fire the conversion's cancellation token. False if it is not running.
    pub fn cancel(&self, id: &str) -> bool {
        match self.conversions.get_mut(id) {
            Some(mut entry) => {
                entry.state.cancel_requested = true;
                entry.cancel_token.cancel();
                tracing::info!(request_id = %id, "Conversion cancel requested");
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<ConversionState> {
        self.conversions.get(id).map(|e| snapshot(&e.state))
    }

    /// All in-flight conversions, oldest first.
    pub fn list(&self) -> Vec<ConversionState> {
        let mut states: Vec<_> = self
            .conversions
            .iter()
            .map(|e| snapshot(&e.state))
            .collect();
        states.sort_by_key(|s| s.started_at);
        states
    }

    pub fn len(&self) -> usize {
        self.conversions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversions.is_empty()
    }

    /// Cancel everything still running.
    pub fn cancel_all(&self) -> usize {
        let mut count = 0;
        for mut entry in self.conversions.iter_mut() {
            entry.state.cancel_requested = true;
            entry.cancel_token.cancel();
            count += 1;
        }
        count
    }
}

fn snapshot(state: &ConversionState) -> ConversionState {
    let mut state = state.clone();
    state.elapsed_ms = state.started_at.elapsed().as_millis() as u64;
    state
}

/// Removes its conversion from the registry on drop.
pub struct RegistrationGuard {
    id: String,
    registry: Arc<ConversionRegistry>,
}

impl RegistrationGuard {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn set_phase(&self, phase: ConversionPhase) {
        self.registry.set_phase(&self.id, phase);
    }
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.registry.conversions.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register(
        registry: &Arc<ConversionRegistry>,
        id: &str,
    ) -> (Result<RegistrationGuard, DuplicateId>, CancellationToken) {
        let token = CancellationToken::new();
        let guard = registry.register(
            id.to_string(),
            DocumentKind::WordProcessor,
            PathBuf::from("/in/a.docx"),
            PathBuf::from("/out/a.pdf"),
            token.clone(),
        );
        (guard, token)
    }

    #[test]
    fn register_and_remove_on_drop() {
        let registry = ConversionRegistry::new();
        let (guard, _) = register(&registry, "c-1");
        let guard = guard.unwrap();

        let state = registry.get("c-1").unwrap();
        assert_eq!(state.phase, ConversionPhase::Acquiring);
        assert_eq!(registry.len(), 1);

        guard.set_phase(ConversionPhase::Converting);
        assert_eq!(registry.get("c-1").unwrap().phase, ConversionPhase::Converting);

        drop(guard);
        assert!(registry.get("c-1").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn duplicate_ids_rejected() {
        let registry = ConversionRegistry::new();
        let (first, _) = register(&registry, "dup");
        let _first = first.unwrap();

        let (second, _) = register(&registry, "dup");
        assert_eq!(second.err(), Some(DuplicateId("dup".to_string())));
    }

    #[test]
    fn cancel_fires_token() {
        let registry = ConversionRegistry::new();
        let (guard, token) = register(&registry, "c-2");
        let _guard = guard.unwrap();

        assert!(!registry.cancel("missing"));
        assert!(registry.cancel("c-2"));
        assert!(token.is_cancelled());
        assert!(registry.get("c-2").unwrap().cancel_requested);
    }

    #[test]
    fn cancel_all_and_list() {
        let registry = ConversionRegistry::new();
        let (a, a_token) = register(&registry, "a");
        let (b, b_token) = register(&registry, "b");
        let (_a, _b) = (a.unwrap(), b.unwrap());

        assert_eq!(registry.list().len(), 2);
        assert_eq!(registry.cancel_all(), 2);
        assert!(a_token.is_cancelled() && b_token.is_cancelled());
    }

    #[test]
    fn state_serializes() {
        let registry = ConversionRegistry::new();
        let (guard, _) = register(&registry, "snap");
        let _guard = guard.unwrap();

        let mut state = registry.get("snap").unwrap();
        state.elapsed_ms = 0;
        insta::assert_json_snapshot!(state, @r#"
        {
          "id": "snap",
          "kind": "word_processor",
          "input_path": "/in/a.docx",
          "output_path": "/out/a.pdf",
          "phase": "acquiring",
          "elapsed_ms": 0,
          "cancel_requested": false
        }
        "#);
    }
}
