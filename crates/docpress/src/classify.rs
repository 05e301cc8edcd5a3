//! Transient vs deterministic classification of native failures.
//!
//! The transient set is an explicit allow-list of codes. Anything outside it
//! is treated as a property of the document: retrying will fail the same
//! way, and the failure says nothing about the health of the instance.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::backend::{NativeError, codes};

/// Codes that mean "the application is busy, gone, or broken".
pub const DEFAULT_TRANSIENT_CODES: [u32; 7] = [
    codes::RPC_E_CALL_REJECTED,
    codes::RPC_E_SERVERCALL_RETRYLATER,
    codes::RPC_E_SERVERFAULT,
    codes::RPC_E_DISCONNECTED,
    codes::RPC_S_SERVER_UNAVAILABLE,
    codes::RPC_S_CALL_FAILED,
    codes::CO_E_SERVER_EXEC_FAILURE,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// May succeed on retry; counts toward the circuit breaker.
    Transient,
    /// Fails the same way every time; never counts toward the breaker.
    Deterministic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorClassifier {
    transient_codes: BTreeSet<u32>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_TRANSIENT_CODES)
    }
}

impl ErrorClassifier {
    pub fn new(transient_codes: impl IntoIterator<Item = u32>) -> Self {
        Self {
            transient_codes: transient_codes.into_iter().collect(),
        }
    }

    pub fn classify(&self, error: &NativeError) -> FailureClass {
        self.classify_code(error.code)
    }

    pub fn classify_code(&self, code: u32) -> FailureClass {
        if self.transient_codes.contains(&code) {
            FailureClass::Transient
        } else {
            FailureClass::Deterministic
        }
    }

    pub fn is_transient(&self, error: &NativeError) -> bool {
        self.classify(error) == FailureClass::Transient
    }

    pub fn transient_codes(&self) -> impl Iterator<Item = u32> + '_ {
        self.transient_codes.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table() {
        let classifier = ErrorClassifier::default();
        let table = [
            (codes::RPC_E_CALL_REJECTED, FailureClass::Transient),
            (codes::RPC_E_SERVERCALL_RETRYLATER, FailureClass::Transient),
            (codes::RPC_E_SERVERFAULT, FailureClass::Transient),
            (codes::RPC_E_DISCONNECTED, FailureClass::Transient),
            (codes::RPC_S_SERVER_UNAVAILABLE, FailureClass::Transient),
            (codes::RPC_S_CALL_FAILED, FailureClass::Transient),
            (codes::CO_E_SERVER_EXEC_FAILURE, FailureClass::Transient),
            (codes::DOCUMENT_NOT_FOUND, FailureClass::Deterministic),
            (codes::DOCUMENT_UNREADABLE, FailureClass::Deterministic),
            (codes::DOCUMENT_PROTECTED, FailureClass::Deterministic),
            (codes::EXPORT_FAILED, FailureClass::Deterministic),
        ];
        for (code, expected) in table {
            assert_eq!(classifier.classify_code(code), expected, "code {:#010x}", code);
        }
    }

    #[test]
    fn unknown_codes_are_deterministic() {
        let classifier = ErrorClassifier::default();
        assert_eq!(classifier.classify_code(0x1234), FailureClass::Deterministic);
    }

    #[test]
    fn custom_table_overrides_defaults() {
        let classifier = ErrorClassifier::new([codes::DOCUMENT_PROTECTED]);
        let busy = NativeError::new(codes::RPC_E_CALL_REJECTED, "busy");
        let locked = NativeError::new(codes::DOCUMENT_PROTECTED, "locked");

        assert!(!classifier.is_transient(&busy));
        assert!(classifier.is_transient(&locked));
    }

    #[test]
    fn serializes_as_plain_code_list() {
        let classifier = ErrorClassifier::new([2, 1]);
        assert_eq!(serde_json::to_string(&classifier).unwrap(), "[1,2]");

        let parsed: ErrorClassifier = serde_json::from_str("[5]").unwrap();
        assert_eq!(parsed.classify_code(5), FailureClass::Transient);
    }
}
