//! The session's error stream.
//!
//! The application may hand `init` a writer (a log file, `stderr`, a buffer).
//! The session writes one line to it per failed call, per error event, and
//! per `info` request.  In asynchronous mode those writes happen on the
//! dispatch thread, so the application can `lock` the sink to interleave its
//! own output: while locked, the session's lines are held back and flushed on
//! `unlock`.

use std::io::Write;

use ncl_core::NclError;
use tracing::warn;

use crate::application::delivery::DeliveryMode;

/// Line-oriented error writer with application-controlled locking.
pub struct ErrorSink {
    writer: Option<Box<dyn Write + Send>>,
    mode: DeliveryMode,
    locked: bool,
    held: Vec<String>,
}

impl ErrorSink {
    pub fn new(writer: Option<Box<dyn Write + Send>>, mode: DeliveryMode) -> Self {
        Self {
            writer,
            mode,
            locked: false,
            held: Vec::new(),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Writes one line, or holds it while the application has the sink locked.
    pub fn line(&mut self, text: &str) {
        if self.writer.is_none() {
            return;
        }
        if self.locked {
            self.held.push(text.to_string());
        } else {
            self.emit(text);
        }
    }

    /// # Errors
    ///
    /// [`NclError::WrongState`] in synchronous mode; [`NclError::Busy`] if
    /// already locked.
    pub fn lock(&mut self) -> Result<(), NclError> {
        if self.mode == DeliveryMode::Synchronous {
            return Err(NclError::wrong_state(
                "lock_error_sink",
                "the error sink is only shared in asynchronous mode",
            ));
        }
        if self.locked {
            return Err(NclError::Busy("the error sink is already locked".to_string()));
        }
        self.locked = true;
        Ok(())
    }

    /// Releases the sink and flushes every line held while it was locked.
    ///
    /// # Errors
    ///
    /// [`NclError::WrongState`] in synchronous mode or if the sink is not locked.
    pub fn unlock(&mut self) -> Result<(), NclError> {
        if self.mode == DeliveryMode::Synchronous {
            return Err(NclError::wrong_state(
                "unlock_error_sink",
                "the error sink is only shared in asynchronous mode",
            ));
        }
        if !self.locked {
            return Err(NclError::wrong_state("unlock_error_sink", "the error sink is not locked"));
        }
        self.locked = false;
        for text in std::mem::take(&mut self.held) {
            self.emit(&text);
        }
        Ok(())
    }

    fn emit(&mut self, text: &str) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        if let Err(err) = writeln!(writer, "{text}").and_then(|()| writer.flush()) {
            warn!(error = %err, "error sink write failed");
        }
    }
}

impl std::fmt::Debug for ErrorSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorSink")
            .field("attached", &self.writer.is_some())
            .field("mode", &self.mode)
            .field("locked", &self.locked)
            .field("held", &self.held.len())
            .finish()
    }
}
