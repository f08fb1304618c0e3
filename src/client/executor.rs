//! The retryable command executor: binds an operation to a selected server and a pooled
//! connection, classifies failures, and drives retries with exponential jittered backoff.

use std::time::Duration;

use rand::Rng;

use super::Client;
use crate::{
    client::options::ServerAddress,
    cmap::Command,
    error::{Error, ErrorKind, Result, NO_WRITES_PERFORMED, RETRYABLE_WRITE_ERROR},
    operation::{command_failure_error, write_concern_error, Operation, Retryability},
    retry::{AttachmentKey, RetryState},
    runtime,
    sdam::{public::ServerType, HandshakePhase},
    selection_criteria::{ReadPreference, SelectionCriteria},
};

/// Every operation gets at most one retry.
const MAX_ATTEMPTS: u32 = 2;

const BACKOFF_INITIAL_MS: u64 = 100;
const BACKOFF_MAX_MS: u64 = 2_000;

/// The server chosen for the first attempt, carried across attempts so that a retry is biased
/// away from it.
const FIRST_TRIED_SERVER: AttachmentKey<ServerAddress> = AttachmentKey::new("firstTriedServer");

impl Client {
    /// Execute the given operation, retrying once when the failure and the operation's
    /// retryability allow it.
    pub(crate) async fn execute_operation<T: Operation>(&self, mut op: T) -> Result<T::O> {
        if self.is_shutdown() {
            return Err(ErrorKind::Shutdown.into());
        }
        let retryability = self.effective_retryability(&op);
        let mut retry_state = RetryState::with_max_attempts(MAX_ATTEMPTS);

        loop {
            // A shutdown mid-retry surfaces the already-chosen error rather than starting
            // another attempt.
            retry_state.break_and_throw_if(|| self.is_shutdown())?;

            if !retry_state.is_first_attempt() {
                op.update_for_retry();
                backoff(retry_state.attempt()).await;
            }

            match self
                .execute_attempt(&mut op, &mut retry_state, retryability)
                .await
            {
                Ok(output) => return Ok(output),
                Err(mut error) => {
                    error.set_attempt(retry_state.attempt());
                    retry_state.advance_or_abort(error, select_retry_error, |_, current| {
                        Ok(locally_retryable(current, retryability))
                    })?;
                }
            }
        }
    }

    /// One attempt: select a server, check out a connection, send the command, interpret the
    /// reply, and feed any failure back into SDAM.
    async fn execute_attempt<T: Operation>(
        &self,
        op: &mut T,
        retry_state: &mut RetryState,
        retryability: Retryability,
    ) -> Result<T::O> {
        let criteria = op
            .selection_criteria()
            .cloned()
            .or_else(|| self.options().selection_criteria.clone())
            .unwrap_or(SelectionCriteria::ReadPreference(ReadPreference::Primary));

        let deprioritized = if retry_state.is_first_attempt() {
            None
        } else {
            retry_state.attachment(&FIRST_TRIED_SERVER).cloned()
        };

        let server = self
            .topology()
            .select_server(&criteria, deprioritized.as_ref())
            .await?;
        retry_state.attach(&FIRST_TRIED_SERVER, server.address.clone(), false);

        let connection = match server.pool.check_out().await {
            Ok(connection) => connection,
            Err(mut error) => {
                // Checkout failures are never specific to the command, so a write may be
                // retried whenever a read could be.
                if retryability == Retryability::Write && error.is_read_retryable() {
                    error.add_label(RETRYABLE_WRITE_ERROR);
                }
                error.set_server_address(server.address.clone());
                return Err(error);
            }
        };

        let stream_description = connection.stream_description()?.clone();
        let max_wire_version = stream_description.max_wire_version.unwrap_or(0);
        let mut command = op.build(&stream_description)?;
        if stream_description.initial_server_type == ServerType::Mongos {
            if let SelectionCriteria::ReadPreference(ref read_preference) = criteria {
                attach_read_pref_for_mongos(&mut command, read_preference);
            }
        }
        tracing::debug!(
            connection = ?connection.info(),
            command = command.name.as_str(),
            attempt = retry_state.attempt(),
            "sending command"
        );

        let response = match connection.send_command(command).await {
            Ok(response) => response,
            Err(mut error) => {
                error.wire_version = stream_description.max_wire_version;
                if retryability == Retryability::Write
                    && error.should_add_retryable_write_label(max_wire_version)
                {
                    error.add_label(RETRYABLE_WRITE_ERROR);
                }
                error.set_server_address(server.address.clone());
                self.topology()
                    .updater()
                    .handle_application_error(
                        server.address.clone(),
                        error.clone(),
                        HandshakePhase::after_completion(&connection),
                    )
                    .await;
                return Err(error);
            }
        };

        if !response.is_success() {
            let mut error = command_failure_error(&response);
            error.wire_version = stream_description.max_wire_version;
            if retryability == Retryability::Write
                && error.should_add_retryable_write_label(max_wire_version)
            {
                error.add_label(RETRYABLE_WRITE_ERROR);
            }
            // State-change errors transition the server to Unknown (and pause its pool on
            // older servers) without closing this connection.
            self.topology()
                .updater()
                .handle_application_error(
                    server.address.clone(),
                    error.clone(),
                    HandshakePhase::after_completion(&connection),
                )
                .await;
            return Err(error);
        }

        if retryability == Retryability::Write {
            if let Some(mut error) = write_concern_error(&response) {
                error.wire_version = stream_description.max_wire_version;
                if error.should_add_retryable_write_label(max_wire_version) {
                    error.add_label(RETRYABLE_WRITE_ERROR);
                }
                return Err(error);
            }
        }

        op.handle_response(response, &stream_description)
    }

    fn effective_retryability<T: Operation>(&self, op: &T) -> Retryability {
        match op.retryability() {
            Retryability::Write if self.options().retry_writes != Some(false) => {
                Retryability::Write
            }
            Retryability::Read if self.options().retry_reads != Some(false) => Retryability::Read,
            _ => Retryability::None,
        }
    }
}

/// Choose which of two attempt errors to propagate: the newer one when it is meaningful (a
/// server error or a retryable one that performed writes), otherwise the original. The
/// superseded error is recorded as suppressed.
fn select_retry_error(previous: Option<&Error>, current: &Error) -> Result<Error> {
    let previous = match previous {
        Some(previous) => previous,
        None => return Ok(current.clone()),
    };
    let prefer_current = (current.is_server_error()
        || current.is_read_retryable()
        || current.is_write_retryable())
        && !current.contains_label(NO_WRITES_PERFORMED);
    let mut chosen = if prefer_current {
        let mut chosen = current.clone();
        chosen.add_suppressed(previous.clone());
        chosen
    } else {
        let mut chosen = previous.clone();
        chosen.add_suppressed(current.clone());
        chosen
    };
    // Retain the richer server address of the two.
    if chosen.server_address().is_none() {
        if let Some(address) = current.server_address().or(previous.server_address()) {
            chosen.set_server_address(address.clone());
        }
    }
    Ok(chosen)
}

/// Whether the executor may recover from this error within its attempt budget. A cleared pool
/// is always recoverable; timeouts always surface.
fn locally_retryable(error: &Error, retryability: Retryability) -> bool {
    if error.is_network_timeout() || error.is_server_selection_error() {
        return false;
    }
    if matches!(error.kind.as_ref(), ErrorKind::WaitQueueTimeout { .. }) {
        return false;
    }
    if error.is_pool_cleared() {
        return true;
    }
    match retryability {
        Retryability::Read => error.is_read_retryable(),
        Retryability::Write => error.is_write_retryable(),
        Retryability::None => false,
    }
}

/// Delay before retry attempt `attempt` (1-based): exponential growth with full jitter.
async fn backoff(attempt: u32) {
    let exponential =
        BACKOFF_INITIAL_MS.saturating_mul(1u64 << (attempt.saturating_sub(1)).min(5));
    let capped = exponential.min(BACKOFF_MAX_MS);
    let jittered = rand::thread_rng().gen_range(0..=capped);
    runtime::delay_for(Duration::from_millis(jittered)).await;
}

/// mongos does not see the driver's selection logic, so non-trivial read preferences must be
/// forwarded in the command itself.
fn attach_read_pref_for_mongos(command: &mut Command, read_preference: &ReadPreference) {
    let forward = match read_preference {
        ReadPreference::Primary => false,
        ReadPreference::SecondaryPreferred { options } => {
            options.tag_sets.is_some() || options.max_staleness.is_some()
        }
        _ => true,
    };
    if forward {
        command.set_read_preference(read_preference);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::CommandError;

    fn command_error(code: i32, labels: Vec<String>) -> Error {
        Error::new(
            ErrorKind::Command(CommandError {
                code,
                code_name: String::new(),
                message: "boom".to_string(),
                error_labels: labels.clone(),
            }),
            Some(labels),
        )
    }

    #[test]
    fn no_writes_performed_prefers_the_first_error() {
        let first = command_error(11600, vec![RETRYABLE_WRITE_ERROR.to_string()]);
        let second = command_error(
            91,
            vec![
                RETRYABLE_WRITE_ERROR.to_string(),
                NO_WRITES_PERFORMED.to_string(),
            ],
        );
        let chosen = select_retry_error(Some(&first), &second).unwrap();
        assert_eq!(chosen.sdam_code(), Some(11600));
        assert_eq!(chosen.suppressed().len(), 1);
    }

    #[test]
    fn meaningful_second_errors_supersede() {
        let first: Error = ErrorKind::from(std::io::ErrorKind::ConnectionReset).into();
        let second = command_error(11600, vec![]);
        let chosen = select_retry_error(Some(&first), &second).unwrap();
        assert_eq!(chosen.sdam_code(), Some(11600));
    }

    #[test]
    fn timeouts_are_never_locally_retried() {
        let timeout = Error::network_timeout();
        assert!(!locally_retryable(&timeout, Retryability::Read));
        assert!(!locally_retryable(&timeout, Retryability::Write));

        let reset: Error = ErrorKind::from(std::io::ErrorKind::ConnectionReset).into();
        assert!(locally_retryable(&reset, Retryability::Read));
        assert!(!locally_retryable(&reset, Retryability::None));
    }

    #[test]
    fn pool_cleared_is_retryable_regardless_of_kind() {
        let err = Error::pool_cleared_error(
            &ServerAddress::default(),
            &ErrorKind::from(std::io::ErrorKind::ConnectionReset).into(),
        );
        assert!(locally_retryable(&err, Retryability::None));
        assert!(locally_retryable(&err, Retryability::Read));
        assert!(locally_retryable(&err, Retryability::Write));
    }
}
