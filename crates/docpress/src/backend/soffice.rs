//! LibreOffice backend.
//!
//! Each instance owns a private user profile directory so several instances
//! can run side by side. An export runs `soffice --headless --convert-to pdf`
//! against that profile; the child pid is published through the instance's
//! [`ProcessToken`] while it runs so a timed-out export can be reaped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use super::{
    Application, ApplicationFactory, DocumentId, DocumentKind, NativeError, ProcessToken, codes,
};

#[derive(Debug, Clone)]
pub struct SofficeOptions {
    /// Path or name of the `soffice` executable.
    pub binary: PathBuf,
    /// Extra arguments appended before the input path.
    pub extra_args: Vec<String>,
}

impl Default for SofficeOptions {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("soffice"),
            extra_args: Vec::new(),
        }
    }
}

impl SofficeOptions {
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }
}

pub struct SofficeFactory {
    options: SofficeOptions,
}

impl SofficeFactory {
    pub fn new(options: SofficeOptions) -> Self {
        Self { options }
    }
}

impl ApplicationFactory for SofficeFactory {
    fn launch(&self, kind: DocumentKind) -> Result<Box<dyn Application>, NativeError> {
        let profile = tempfile::Builder::new()
            .prefix("docpress-profile-")
            .tempdir()
            .map_err(|e| {
                NativeError::new(
                    codes::CO_E_SERVER_EXEC_FAILURE,
                    format!("failed to create profile directory: {}", e),
                )
            })?;

        tracing::debug!(%kind, profile = %profile.path().display(), "Launched soffice instance");

        Ok(Box::new(SofficeInstance {
            kind,
            options: self.options.clone(),
            profile,
            token: ProcessToken::new(),
            documents: HashMap::new(),
            next_document: 1,
        }))
    }

    fn is_available(&self) -> bool {
        Command::new(&self.options.binary)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    fn describe(&self) -> String {
        format!("soffice ({})", self.options.binary.display())
    }
}

struct SofficeInstance {
    kind: DocumentKind,
    options: SofficeOptions,
    profile: tempfile::TempDir,
    token: ProcessToken,
    documents: HashMap<DocumentId, PathBuf>,
    next_document: u64,
}

impl SofficeInstance {
    fn export_filter(&self) -> &'static str {
        match self.kind {
            DocumentKind::WordProcessor => "pdf:writer_pdf_Export",
            DocumentKind::Spreadsheet => "pdf:calc_pdf_Export",
        }
    }

    fn profile_url(&self) -> String {
        format!("-env:UserInstallation=file://{}", self.profile.path().display())
    }
}

impl Application for SofficeInstance {
    fn process_token(&self) -> ProcessToken {
        self.token.clone()
    }

    fn probe(&mut self) -> Result<(), NativeError> {
        if !self.profile.path().is_dir() {
            return Err(NativeError::new(
                codes::RPC_E_DISCONNECTED,
                "profile directory disappeared",
            ));
        }
        if let Some(pid) = self.token.current() {
            return Err(NativeError::new(
                codes::RPC_E_CALL_REJECTED,
                format!("export process {} still running", pid),
            ));
        }
        Ok(())
    }

    fn open(&mut self, input: &Path) -> Result<DocumentId, NativeError> {
        if !input.is_file() {
            return Err(NativeError::new(
                codes::DOCUMENT_NOT_FOUND,
                format!("{} is not a readable file", input.display()),
            ));
        }
        let id = DocumentId(self.next_document);
        self.next_document += 1;
        self.documents.insert(id, input.to_path_buf());
        Ok(id)
    }

    fn export_pdf(&mut self, document: DocumentId, output: &Path) -> Result<(), NativeError> {
        let input = self.documents.get(&document).cloned().ok_or_else(|| {
            NativeError::new(codes::RPC_S_CALL_FAILED, "document is not open")
        })?;

        let staging = tempfile::Builder::new()
            .prefix("docpress-out-")
            .tempdir()
            .map_err(|e| {
                NativeError::new(
                    codes::RPC_S_CALL_FAILED,
                    format!("failed to create staging directory: {}", e),
                )
            })?;

        let mut command = Command::new(&self.options.binary);
        // The reaper signals the whole group.
        #[cfg(unix)]
        std::os::unix::process::CommandExt::process_group(&mut command, 0);

        let mut child = command
            .arg(self.profile_url())
            .args(["--headless", "--invisible", "--norestore", "--nolockcheck"])
            .arg("--convert-to")
            .arg(self.export_filter())
            .arg("--outdir")
            .arg(staging.path())
            .args(&self.options.extra_args)
            .arg(&input)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                NativeError::new(
                    codes::CO_E_SERVER_EXEC_FAILURE,
                    format!("failed to start soffice: {}", e),
                )
            })?;

        self.token.set(child.id());
        let status = child.wait();
        self.token.clear();

        let status = status.map_err(|e| {
            NativeError::new(
                codes::RPC_E_DISCONNECTED,
                format!("lost track of soffice: {}", e),
            )
        })?;

        match status.code() {
            None => {
                return Err(NativeError::new(
                    codes::RPC_E_DISCONNECTED,
                    "soffice was terminated by a signal",
                ));
            }
            Some(0) => {}
            Some(code) => {
                return Err(NativeError::new(
                    codes::RPC_S_CALL_FAILED,
                    format!("soffice exited with status {}", code),
                ));
            }
        }

        // soffice exits 0 without output when it cannot parse the document.
        let mut produced_name = input.file_stem().unwrap_or_default().to_os_string();
        produced_name.push(".pdf");
        let produced = staging.path().join(produced_name);
        if !produced.is_file() {
            return Err(NativeError::new(
                codes::EXPORT_FAILED,
                format!("no PDF produced for {}", input.display()),
            ));
        }

        move_file(&produced, output).map_err(|e| {
            NativeError::new(
                codes::RPC_S_CALL_FAILED,
                format!("failed to write {}: {}", output.display(), e),
            )
        })
    }

    fn close(&mut self, document: DocumentId) -> Result<(), NativeError> {
        self.documents.remove(&document);
        Ok(())
    }

    fn quit(&mut self) -> Result<(), NativeError> {
        self.documents.clear();
        self.token.clear();
        Ok(())
    }
}

/// Rename, falling back to copy + remove across filesystems.
fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    std::fs::copy(from, to)?;
    std::fs::remove_file(from)
}
