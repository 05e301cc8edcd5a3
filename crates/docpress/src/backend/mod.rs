//! Native application seam.
//!
//! The office application is reached through two narrow traits:
//! - [`ApplicationFactory`] launches instances and answers "is it installed".
//! - [`Application`] is one running instance: open, export, close, probe, quit.
//!
//! `Application` is deliberately not `Send`. Instances are created inside an
//! executor apartment and never leave the thread that created them; the pool
//! only ever holds an [`InstanceId`] and a [`ProcessToken`].

mod soffice;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

pub use soffice::{SofficeFactory, SofficeOptions};

/// HRESULT-style status codes reported by backends.
///
/// The transient subset lives in [`crate::classify`]; everything else is
/// treated as a property of the document.
pub mod codes {
    /// The application rejected the call because it is busy.
    pub const RPC_E_CALL_REJECTED: u32 = 0x8001_0001;
    /// The application asked the caller to retry later.
    pub const RPC_E_SERVERCALL_RETRYLATER: u32 = 0x8001_010A;
    /// The application faulted while servicing the call.
    pub const RPC_E_SERVERFAULT: u32 = 0x8001_0105;
    /// The connection to the application process was lost.
    pub const RPC_E_DISCONNECTED: u32 = 0x8001_0108;
    /// The application process is not reachable.
    pub const RPC_S_SERVER_UNAVAILABLE: u32 = 0x8007_06BA;
    /// The call failed inside the application process.
    pub const RPC_S_CALL_FAILED: u32 = 0x8007_06BE;
    /// The application process could not be started.
    pub const CO_E_SERVER_EXEC_FAILURE: u32 = 0x8008_0005;

    /// The input document does not exist or cannot be read.
    pub const DOCUMENT_NOT_FOUND: u32 = 0x800A_1436;
    /// The application could not parse the document.
    pub const DOCUMENT_UNREADABLE: u32 = 0x800A_03EC;
    /// The document is password protected.
    pub const DOCUMENT_PROTECTED: u32 = 0x800A_1520;
    /// The application produced no PDF for the document.
    pub const EXPORT_FAILED: u32 = 0x800A_175D;
}

/// Which office application handles a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    WordProcessor,
    Spreadsheet,
}

impl DocumentKind {
    pub const ALL: [DocumentKind; 2] = [DocumentKind::WordProcessor, DocumentKind::Spreadsheet];

    /// Resolve the handling application from the file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "doc" | "docx" | "docm" | "dot" | "dotx" | "odt" | "ott" | "rtf" | "txt" | "wpd" => {
                Some(DocumentKind::WordProcessor)
            }
            "xls" | "xlsx" | "xlsm" | "xlsb" | "xlt" | "xltx" | "ods" | "ots" | "csv" => {
                Some(DocumentKind::Spreadsheet)
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::WordProcessor => "word_processor",
            DocumentKind::Spreadsheet => "spreadsheet",
        }
    }
}

impl std::fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unique identifier for a launched application instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(uuid::Uuid);

impl InstanceId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle to a document opened inside one application instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DocumentId(pub u64);

/// Error reported by the native application.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} (code {code:#010x})")]
pub struct NativeError {
    pub code: u32,
    pub message: String,
}

impl NativeError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Identity of the OS process currently backing an instance.
///
/// Shared between the apartment (which updates it) and the pool (which reads
/// it from other threads to reap orphaned processes after a timeout).
#[derive(Debug, Clone, Default)]
pub struct ProcessToken(Arc<AtomicU32>);

impl ProcessToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for an instance backed by one long-lived process.
    pub fn fixed(pid: u32) -> Self {
        let token = Self::new();
        token.set(pid);
        token
    }

    pub fn set(&self, pid: u32) {
        self.0.store(pid, Ordering::Release);
    }

    pub fn clear(&self) {
        self.0.store(0, Ordering::Release);
    }

    pub fn current(&self) -> Option<u32> {
        match self.0.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }
}

/// One running office application instance.
///
/// Every method is called on the apartment thread that launched the instance.
pub trait Application {
    /// Process identity used for external cleanup.
    fn process_token(&self) -> ProcessToken;

    /// Cheap no-op round trip used by the health monitor.
    fn probe(&mut self) -> Result<(), NativeError>;

    fn open(&mut self, input: &Path) -> Result<DocumentId, NativeError>;

    fn export_pdf(&mut self, document: DocumentId, output: &Path) -> Result<(), NativeError>;

    fn close(&mut self, document: DocumentId) -> Result<(), NativeError>;

    /// Shut the instance down. Called exactly once, on the owning thread.
    fn quit(&mut self) -> Result<(), NativeError>;
}

/// Launches application instances.
pub trait ApplicationFactory: Send + Sync + 'static {
    /// Start a new instance. Runs on the apartment thread that will own it.
    fn launch(&self, kind: DocumentKind) -> Result<Box<dyn Application>, NativeError>;

    /// Whether the application is installed and launchable. May block.
    fn is_available(&self) -> bool;

    /// Human-readable backend description for health output.
    fn describe(&self) -> String {
        "unknown".to_string()
    }
}

/// Open, export and close one document on an instance.
///
/// The document is closed even when the export fails; the export error wins.
pub fn convert_on_instance(
    app: &mut dyn Application,
    input: &Path,
    output: &Path,
) -> Result<(), NativeError> {
    let document = app.open(input)?;
    let exported = app.export_pdf(document, output);
    let closed = app.close(document);
    exported.and(closed)
}
