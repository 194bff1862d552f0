use super::{RowRecord, RowStatus, Transition, TransitionError};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Changed(RowRecord),
    /// Idempotent repeat of a transition that already took effect.
    Unchanged,
}

pub fn log_line(now: DateTime<Utc>, message: &str) -> String {
    format!("{} - {message}", now.format("%Y-%m-%d %H:%M:%S"))
}

/// Pure transition table.
///
/// | from \ via  | Accept    | Begin      | Complete(p)      | Fail(c)          | Note   |
/// |-------------|-----------|------------|------------------|------------------|--------|
/// | absent      | pending   | processing | reject           | error            | reject |
/// | pending     | no-op     | processing | reject           | error            | log    |
/// | processing  | reject    | reject     | done             | error            | log    |
/// | done(p)     | reject    | reject     | same p: no-op    | reject           | reject |
/// | error(c)    | reject    | reject     | reject           | same c: no-op    | reject |
pub fn apply(
    row_key: &str,
    current: Option<&RowRecord>,
    transition: &Transition,
    now: DateTime<Utc>,
) -> Result<Applied, TransitionError> {
    let Some(current) = current else {
        return from_absent(row_key, transition, now);
    };
    let terminal = || TransitionError::Terminal {
        row_key: row_key.to_string(),
        status: current.status,
    };
    let next = |status: RowStatus, message: &str| {
        let mut record = current.clone();
        record.status = status;
        record.log.push(log_line(now, message));
        record.updated_at = now;
        record
    };

    match (current.status, transition) {
        (RowStatus::Pending, Transition::Accept { .. }) => Ok(Applied::Unchanged),
        (RowStatus::Processing, Transition::Accept { .. } | Transition::Begin) => {
            Err(TransitionError::AlreadyProcessing {
                row_key: row_key.to_string(),
            })
        }
        (RowStatus::Pending, Transition::Begin) => {
            Ok(Applied::Changed(next(RowStatus::Processing, "processing started")))
        }
        (RowStatus::Pending | RowStatus::Processing, Transition::Note(message)) => {
            Ok(Applied::Changed(next(current.status, message)))
        }
        (RowStatus::Pending | RowStatus::Processing, Transition::Fail(cause)) => {
            let mut record = next(RowStatus::Error, &format!("error: {cause}"));
            record.cause = Some(cause.clone());
            Ok(Applied::Changed(record))
        }
        (RowStatus::Processing, Transition::Complete(result)) => {
            let mut record = next(RowStatus::Done, "done");
            record.result = Some((**result).clone());
            Ok(Applied::Changed(record))
        }
        (RowStatus::Pending, Transition::Complete(_)) => Err(TransitionError::NotProcessing {
            row_key: row_key.to_string(),
            status: current.status,
        }),
        (RowStatus::Done, Transition::Complete(result))
            if current.result.as_ref() == Some(result.as_ref()) =>
        {
            Ok(Applied::Unchanged)
        }
        (RowStatus::Error, Transition::Fail(cause)) if current.cause.as_ref() == Some(cause) => {
            Ok(Applied::Unchanged)
        }
        (RowStatus::Done | RowStatus::Error, _) => Err(terminal()),
    }
}

fn from_absent(
    row_key: &str,
    transition: &Transition,
    now: DateTime<Utc>,
) -> Result<Applied, TransitionError> {
    let fresh = |status: RowStatus, message: &str| RowRecord {
        row_key: row_key.to_string(),
        status,
        correlation_id: None,
        log: vec![log_line(now, message)],
        cause: None,
        result: None,
        updated_at: now,
    };
    match transition {
        Transition::Accept { correlation_id } => {
            let mut record = fresh(RowStatus::Pending, "accepted");
            record.correlation_id = correlation_id.clone();
            Ok(Applied::Changed(record))
        }
        Transition::Begin => Ok(Applied::Changed(fresh(
            RowStatus::Processing,
            "processing started",
        ))),
        Transition::Fail(cause) => {
            let mut record = fresh(RowStatus::Error, &format!("error: {cause}"));
            record.cause = Some(cause.clone());
            Ok(Applied::Changed(record))
        }
        Transition::Complete(_) | Transition::Note(_) => Err(TransitionError::UnknownRow {
            row_key: row_key.to_string(),
        }),
    }
}
