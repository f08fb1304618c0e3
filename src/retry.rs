//! Attempt accounting for retryable operations: which error to propagate when retries stop,
//! typed cross-attempt attachments, and break-out support.

use std::{
    any::Any,
    collections::HashMap,
    marker::PhantomData,
};

use crate::error::{Error, Result};

/// A typed key into a [`RetryState`]'s attachment map.
pub(crate) struct AttachmentKey<T> {
    name: &'static str,
    _value: PhantomData<fn() -> T>,
}

impl<T> AttachmentKey<T> {
    pub(crate) const fn new(name: &'static str) -> Self {
        Self {
            name,
            _value: PhantomData,
        }
    }
}

struct Attachment {
    value: Box<dyn Any + Send + Sync>,
    auto_remove: bool,
}

/// Per-operation retry accounting: the 0-based attempt index, the allowed number of attempts,
/// the currently chosen error to propagate should retrying stop, and attachments carried
/// between attempts.
pub(crate) struct RetryState {
    attempt: u32,
    max_attempts: Option<u32>,
    chosen_error: Option<Error>,
    marked_last: bool,
    attachments: HashMap<&'static str, Attachment>,
}

impl RetryState {
    /// A state allowing up to `max_attempts` total attempts; must be at least 1.
    pub(crate) fn with_max_attempts(max_attempts: u32) -> Self {
        debug_assert!(max_attempts >= 1);
        Self {
            attempt: 0,
            max_attempts: Some(max_attempts.max(1)),
            chosen_error: None,
            marked_last: false,
            attachments: HashMap::new(),
        }
    }

    /// A state with no attempt bound; termination comes from the retry predicate.
    #[allow(dead_code)]
    pub(crate) fn unbounded() -> Self {
        Self {
            attempt: 0,
            max_attempts: None,
            chosen_error: None,
            marked_last: false,
            attachments: HashMap::new(),
        }
    }

    /// The 0-based index of the current attempt.
    pub(crate) fn attempt(&self) -> u32 {
        self.attempt
    }

    pub(crate) fn is_first_attempt(&self) -> bool {
        self.attempt == 0
    }

    /// Whether the current attempt is the final allowed one.
    pub(crate) fn is_last_attempt(&self) -> bool {
        self.marked_last
            || self
                .max_attempts
                .map(|max| self.attempt + 1 >= max)
                .unwrap_or(false)
    }

    /// Store a value carried across attempts. Auto-removed values are cleared at each attempt
    /// boundary.
    pub(crate) fn attach<T: Any + Send + Sync>(
        &mut self,
        key: &AttachmentKey<T>,
        value: T,
        auto_remove: bool,
    ) {
        self.attachments.insert(
            key.name,
            Attachment {
                value: Box::new(value),
                auto_remove,
            },
        );
    }

    /// Retrieve an attachment stored under `key`.
    pub(crate) fn attachment<T: Any + Send + Sync>(&self, key: &AttachmentKey<T>) -> Option<&T> {
        self.attachments
            .get(key.name)
            .and_then(|attachment| attachment.value.downcast_ref())
    }

    /// Process an attempt failure: choose which error to propagate via `transformer`, stop if
    /// attempts are exhausted or `predicate` declines, otherwise advance to the next attempt.
    ///
    /// `transformer(previously_chosen, current)` selects the error that will be propagated if
    /// retrying stops; an error from the transformer replaces both candidates, which are
    /// recorded as suppressed. An error from the predicate supersedes the chosen error
    /// likewise.
    pub(crate) fn advance_or_abort(
        &mut self,
        current: Error,
        transformer: impl FnOnce(Option<&Error>, &Error) -> Result<Error>,
        predicate: impl FnOnce(&RetryState, &Error) -> Result<bool>,
    ) -> Result<()> {
        let chosen = match transformer(self.chosen_error.as_ref(), &current) {
            Ok(chosen) => chosen,
            Err(mut thrown) => {
                if let Some(previous) = self.chosen_error.take() {
                    thrown.add_suppressed(previous);
                }
                thrown.add_suppressed(current);
                self.marked_last = true;
                self.chosen_error = Some(thrown.clone());
                return Err(thrown);
            }
        };

        if self.is_last_attempt() {
            self.chosen_error = Some(chosen.clone());
            return Err(chosen);
        }

        match predicate(self, &current) {
            Err(mut thrown) => {
                thrown.add_suppressed(chosen);
                self.marked_last = true;
                self.chosen_error = Some(thrown.clone());
                Err(thrown)
            }
            Ok(false) => {
                self.chosen_error = Some(chosen.clone());
                self.marked_last = true;
                Err(chosen)
            }
            Ok(true) => {
                self.chosen_error = Some(chosen);
                self.attempt += 1;
                self.attachments
                    .retain(|_, attachment| !attachment.auto_remove);
                Ok(())
            }
        }
    }

    /// During a retry attempt, abort with the currently chosen error if `predicate` holds. A
    /// no-op during the first attempt. The caller must still unwind its in-progress attempt.
    pub(crate) fn break_and_throw_if(&mut self, predicate: impl FnOnce() -> bool) -> Result<()> {
        if self.is_first_attempt() {
            return Ok(());
        }
        if predicate() {
            self.marked_last = true;
            return Err(self.chosen_or_internal());
        }
        Ok(())
    }

    /// The callback flavor of [`break_and_throw_if`](Self::break_and_throw_if): relays the
    /// break-out decision to `callback` instead of returning it, reporting whether the
    /// operation broke out. Used by callback-based operation surfaces.
    #[allow(dead_code)]
    pub(crate) fn break_and_complete_if(
        &mut self,
        predicate: impl FnOnce() -> bool,
        callback: impl FnOnce(Error),
    ) -> bool {
        if self.is_first_attempt() || !predicate() {
            return false;
        }
        self.marked_last = true;
        callback(self.chosen_or_internal());
        true
    }

    fn chosen_or_internal(&self) -> Error {
        self.chosen_error
            .clone()
            .unwrap_or_else(|| Error::internal("retry broken out before any failure was recorded"))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::ErrorKind;

    fn numbered_error(n: u32) -> Error {
        ErrorKind::Internal {
            message: format!("attempt {}", n),
        }
        .into()
    }

    fn message(error: &Error) -> String {
        match error.kind.as_ref() {
            ErrorKind::Internal { message } => message.clone(),
            other => panic!("unexpected error kind {:?}", other),
        }
    }

    /// A transformer that always picks the newest error, recording the previous one as
    /// suppressed.
    fn prefer_current(previous: Option<&Error>, current: &Error) -> Result<Error> {
        let mut chosen = current.clone();
        if let Some(previous) = previous {
            chosen.add_suppressed(previous.clone());
        }
        Ok(chosen)
    }

    #[test]
    fn final_error_is_last_attempts_with_prior_suppressed() {
        let mut state = RetryState::with_max_attempts(3);

        state
            .advance_or_abort(numbered_error(1), prefer_current, |_, _| Ok(true))
            .unwrap();
        assert_eq!(state.attempt(), 1);

        state
            .advance_or_abort(numbered_error(2), prefer_current, |_, _| Ok(true))
            .unwrap();
        assert_eq!(state.attempt(), 2);
        assert!(state.is_last_attempt());

        let thrown = state
            .advance_or_abort(numbered_error(3), prefer_current, |_, _| Ok(true))
            .unwrap_err();
        assert_eq!(message(&thrown), "attempt 3");
        assert_eq!(thrown.suppressed().len(), 1);
        assert_eq!(message(&thrown.suppressed()[0]), "attempt 2");
    }

    #[test]
    fn declining_predicate_throws_the_chosen_error() {
        let mut state = RetryState::with_max_attempts(5);
        let thrown = state
            .advance_or_abort(numbered_error(1), prefer_current, |_, _| Ok(false))
            .unwrap_err();
        assert_eq!(message(&thrown), "attempt 1");
        assert!(state.is_last_attempt());
    }

    #[test]
    fn transformer_failure_replaces_both_candidates() {
        let mut state = RetryState::with_max_attempts(3);
        state
            .advance_or_abort(numbered_error(1), prefer_current, |_, _| Ok(true))
            .unwrap();

        let thrown = state
            .advance_or_abort(
                numbered_error(2),
                |_, _| {
                    Err(ErrorKind::Internal {
                        message: "transformer exploded".to_string(),
                    }
                    .into())
                },
                |_, _| Ok(true),
            )
            .unwrap_err();
        assert_eq!(message(&thrown), "transformer exploded");
        let suppressed: Vec<_> = thrown.suppressed().iter().map(message).collect();
        assert_eq!(suppressed, vec!["attempt 1", "attempt 2"]);
    }

    #[test]
    fn predicate_failure_supersedes_the_chosen_error() {
        let mut state = RetryState::with_max_attempts(3);
        let thrown = state
            .advance_or_abort(numbered_error(1), prefer_current, |_, _| {
                Err(ErrorKind::Internal {
                    message: "predicate exploded".to_string(),
                }
                .into())
            })
            .unwrap_err();
        assert_eq!(message(&thrown), "predicate exploded");
        assert_eq!(thrown.suppressed().len(), 1);
    }

    #[test]
    fn break_out_is_a_noop_on_the_first_attempt() {
        let mut state = RetryState::with_max_attempts(2);
        state.break_and_throw_if(|| true).unwrap();
        assert!(!state.is_last_attempt());
    }

    #[test]
    fn break_out_throws_chosen_on_later_attempts() {
        let mut state = RetryState::with_max_attempts(3);
        state
            .advance_or_abort(numbered_error(1), prefer_current, |_, _| Ok(true))
            .unwrap();

        // A false predicate changes nothing.
        state.break_and_throw_if(|| false).unwrap();
        assert!(!state.is_last_attempt());

        let thrown = state.break_and_throw_if(|| true).unwrap_err();
        assert_eq!(message(&thrown), "attempt 1");
        assert!(state.is_last_attempt());

        // The callback variant relays the same decision.
        let mut state = RetryState::with_max_attempts(3);
        state
            .advance_or_abort(numbered_error(1), prefer_current, |_, _| Ok(true))
            .unwrap();
        let mut relayed = None;
        assert!(state.break_and_complete_if(|| true, |error| relayed = Some(error)));
        assert_eq!(message(&relayed.unwrap()), "attempt 1");
    }

    #[test]
    fn attachments_respect_auto_removal() {
        const STICKY: AttachmentKey<u32> = AttachmentKey::new("sticky");
        const PER_ATTEMPT: AttachmentKey<String> = AttachmentKey::new("perAttempt");

        let mut state = RetryState::with_max_attempts(3);
        state.attach(&STICKY, 7, false);
        state.attach(&PER_ATTEMPT, "only this attempt".to_string(), true);

        assert_eq!(state.attachment(&STICKY), Some(&7));
        assert!(state.attachment(&PER_ATTEMPT).is_some());

        state
            .advance_or_abort(numbered_error(1), prefer_current, |_, _| Ok(true))
            .unwrap();

        assert_eq!(state.attachment(&STICKY), Some(&7));
        assert!(state.attachment(&PER_ATTEMPT).is_none());
    }

    #[test]
    fn unbounded_states_retry_while_the_predicate_allows() {
        let mut state = RetryState::unbounded();
        for i in 0..100 {
            state
                .advance_or_abort(numbered_error(i), prefer_current, |_, _| Ok(true))
                .unwrap();
        }
        assert_eq!(state.attempt(), 100);
        assert!(!state.is_last_attempt());
    }
}
