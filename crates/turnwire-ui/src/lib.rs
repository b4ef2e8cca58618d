//! Optimistic send coordination for the composer.
//!
//! Sending is a two-phase affair: [`SendCoordinator::begin`] immediately
//! shows the message as pending and clears the composer, then pre-checks run
//! and the send either commits or rolls back. Rollback restores the composer
//! text exactly as it was, so a failed check costs the user nothing.

use thiserror::Error;
use turnwire_core::LimitsConfig;

/// Why a draft was not allowed to go out.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct PreCheckFailure {
    pub reason: String,
}

impl PreCheckFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoordinatorError {
    /// Only one send may be in flight; the single-active-turn rule starts
    /// here at the composer.
    #[error("another send is already pending")]
    InteractionPending,
    /// The handle was already committed or rolled back.
    #[error("send handle is no longer pending")]
    StaleHandle,
    #[error("pre-check rejected the draft: {0}")]
    CheckFailed(PreCheckFailure),
}

/// A validation gate that runs between `begin` and `commit`. Quota and
/// policy checks plug in through this.
pub trait PreCheck {
    fn check(&self, draft: &str) -> Result<(), PreCheckFailure>;
}

/// Rejects drafts that are empty or all whitespace.
pub struct NonEmptyCheck;

impl PreCheck for NonEmptyCheck {
    fn check(&self, draft: &str) -> Result<(), PreCheckFailure> {
        if draft.trim().is_empty() {
            Err(PreCheckFailure::new("draft is empty"))
        } else {
            Ok(())
        }
    }
}

/// Rejects drafts over a byte budget.
pub struct LengthQuota {
    max_bytes: usize,
}

impl LengthQuota {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }
}

impl PreCheck for LengthQuota {
    fn check(&self, draft: &str) -> Result<(), PreCheckFailure> {
        if draft.len() > self.max_bytes {
            Err(PreCheckFailure::new(format!(
                "draft is {} bytes, over the {} byte limit",
                draft.len(),
                self.max_bytes
            )))
        } else {
            Ok(())
        }
    }
}

/// The checks every send runs by default.
pub fn standard_checks(limits: &LimitsConfig) -> Vec<Box<dyn PreCheck>> {
    vec![
        Box::new(NonEmptyCheck),
        Box::new(LengthQuota::new(limits.max_draft_bytes)),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    /// Shown optimistically; not yet committed.
    Pending,
    Sent,
}

/// One user message in the transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEntry {
    pub text: String,
    pub status: EntryStatus,
}

/// Ticket for one in-flight send. Resolving it twice is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendHandle(u64);

#[derive(Debug)]
struct PendingSend {
    handle: u64,
    entry_index: usize,
    original_input: String,
}

/// Owns the composer text and the outgoing side of the transcript.
#[derive(Debug, Default)]
pub struct SendCoordinator {
    input: String,
    transcript: Vec<TranscriptEntry>,
    pending: Option<PendingSend>,
    next_handle: u64,
    /// Reason of the most recent rollback, for the front end to display.
    last_failure: Option<String>,
}

impl SendCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn set_input(&mut self, text: impl Into<String>) {
        self.input = text.into();
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        &self.transcript
    }

    pub fn last_failure(&self) -> Option<&str> {
        self.last_failure.as_deref()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Start sending the current composer text: the message appears in the
    /// transcript as pending and the composer clears. At most one send may
    /// be outstanding.
    pub fn begin(&mut self) -> Result<SendHandle, CoordinatorError> {
        if self.pending.is_some() {
            return Err(CoordinatorError::InteractionPending);
        }
        let original_input = std::mem::take(&mut self.input);
        self.transcript.push(TranscriptEntry {
            text: original_input.clone(),
            status: EntryStatus::Pending,
        });
        self.next_handle += 1;
        let handle = self.next_handle;
        self.pending = Some(PendingSend {
            handle,
            entry_index: self.transcript.len() - 1,
            original_input,
        });
        self.last_failure = None;
        Ok(SendHandle(handle))
    }

    /// Finalize a pending send, returning the draft text to hand to the
    /// turn driver. `None` when the handle was already resolved.
    pub fn commit(&mut self, handle: SendHandle) -> Option<String> {
        let pending = self.take_if_matching(handle)?;
        let entry = &mut self.transcript[pending.entry_index];
        entry.status = EntryStatus::Sent;
        Some(entry.text.clone())
    }

    /// Undo a pending send: the optimistic message disappears and the
    /// composer gets its text back exactly as it was before `begin`.
    /// Returns whether anything was rolled back.
    pub fn rollback(&mut self, handle: SendHandle, reason: &str) -> bool {
        let Some(pending) = self.take_if_matching(handle) else {
            return false;
        };
        self.transcript.remove(pending.entry_index);
        self.input = pending.original_input;
        self.last_failure = Some(reason.to_string());
        true
    }

    /// Run the checks and commit, or roll back on the first failure.
    pub fn resolve(
        &mut self,
        handle: SendHandle,
        checks: &[Box<dyn PreCheck>],
    ) -> Result<String, CoordinatorError> {
        let draft = match &self.pending {
            Some(pending) if pending.handle == handle.0 => pending.original_input.clone(),
            _ => return Err(CoordinatorError::StaleHandle),
        };
        for check in checks {
            if let Err(failure) = check.check(&draft) {
                self.rollback(handle, &failure.reason);
                return Err(CoordinatorError::CheckFailed(failure));
            }
        }
        self.commit(handle)
            .ok_or(CoordinatorError::StaleHandle)
    }

    fn take_if_matching(&mut self, handle: SendHandle) -> Option<PendingSend> {
        match &self.pending {
            Some(pending) if pending.handle == handle.0 => self.pending.take(),
            _ => None,
        }
    }
}
