//! Migration phase transitions.
//!
//! Every move goes through [`StateStore::transition_migration`], a
//! compare-and-set on the current status, so two dispatchers can never run
//! the same phase. The retry loop is the explicit `Failed → Scheduled`
//! edge; the store refuses it once `retry_count` reaches `max_retries`.

use hearthgrid_state::{MigrationRecord, MigrationStatus, StateStore, Transition};

use crate::error::{MigrateError, MigrateResult};

/// The phase after `status` on the success path.
pub fn next_phase(status: MigrationStatus) -> Option<MigrationStatus> {
    match status {
        MigrationStatus::Scheduled => Some(MigrationStatus::Preparing),
        MigrationStatus::Preparing => Some(MigrationStatus::Transferring),
        MigrationStatus::Transferring => Some(MigrationStatus::Completing),
        MigrationStatus::Completing => Some(MigrationStatus::Completed),
        _ => None,
    }
}

/// Move migration `id` from `from` to `to`, or report the status that
/// blocked it.
pub fn transition<F>(
    state: &StateStore,
    id: &str,
    from: &[MigrationStatus],
    to: MigrationStatus,
    update: F,
) -> MigrateResult<MigrationRecord>
where
    F: FnOnce(&mut MigrationRecord),
{
    match state
        .transition_migration(id, from, to, update)
        .map_err(|e| missing_migration(id, e))?
    {
        Transition::Applied(m) => Ok(m),
        Transition::Rejected(m) => Err(MigrateError::IllegalTransition {
            id: id.to_string(),
            from: m.status,
            to,
        }),
    }
}

/// Advance migration `id` from `from` to the next phase.
pub fn advance<F>(
    state: &StateStore,
    id: &str,
    from: MigrationStatus,
    update: F,
) -> MigrateResult<MigrationRecord>
where
    F: FnOnce(&mut MigrationRecord),
{
    let Some(to) = next_phase(from) else {
        return Err(MigrateError::IllegalTransition {
            id: id.to_string(),
            from,
            to: from,
        });
    };
    transition(state, id, &[from], to, update)
}

/// What happened to a migration after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// Back to `Scheduled`, due again at `scheduled_at`.
    Rescheduled(MigrationRecord),
    /// Retry budget spent; the migration stays `Failed`.
    Exhausted(MigrationRecord),
}

impl FailureOutcome {
    pub fn record(&self) -> &MigrationRecord {
        match self {
            FailureOutcome::Rescheduled(m) | FailureOutcome::Exhausted(m) => m,
        }
    }

    pub fn will_retry(&self) -> bool {
        matches!(self, FailureOutcome::Rescheduled(_))
    }
}

/// Fail migration `id` (currently in `from`) and take the retry edge if
/// the budget allows.
///
/// The target is forgotten unless it was pinned by the requester, so a
/// retry may pick a different node.
pub fn fail_and_retry(
    state: &StateStore,
    id: &str,
    from: MigrationStatus,
    error: &str,
    retry_at: u64,
) -> MigrateResult<FailureOutcome> {
    transition(state, id, &[from], MigrationStatus::Failed, |m| {
        m.retry_count += 1;
        m.last_error = Some(error.to_string());
        m.source_container_id = None;
        m.target_container_id = None;
        m.target_ram_mb = 0;
        if !m.target_pinned {
            m.target_node_id = None;
        }
    })?;
    retry(state, id, retry_at)
}

/// Take the bounded `Failed → Scheduled` edge.
pub fn retry(state: &StateStore, id: &str, retry_at: u64) -> MigrateResult<FailureOutcome> {
    match state
        .transition_migration(id, &[MigrationStatus::Failed], MigrationStatus::Scheduled, |m| {
            m.scheduled_at = retry_at;
            m.started_at = None;
        })
        .map_err(|e| missing_migration(id, e))?
    {
        Transition::Applied(m) => Ok(FailureOutcome::Rescheduled(m)),
        Transition::Rejected(m) => Ok(FailureOutcome::Exhausted(m)),
    }
}

fn missing_migration(id: &str, e: hearthgrid_state::StateError) -> MigrateError {
    match e {
        hearthgrid_state::StateError::NotFound(_) => MigrateError::MigrationNotFound(id.to_string()),
        other => other.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearthgrid_state::MigrationReason;

    fn store_with(status: MigrationStatus, max_retries: u32) -> StateStore {
        let state = StateStore::open_in_memory().unwrap();
        let mut m = MigrationRecord::new(
            "m1",
            "w1",
            "n1",
            None,
            MigrationReason::Manual,
            max_retries,
            100,
            100,
        );
        m.status = status;
        state.put_migration(&m).unwrap();
        state
    }

    #[test]
    fn phases_follow_protocol_order() {
        let state = store_with(MigrationStatus::Scheduled, 3);
        let mut status = MigrationStatus::Scheduled;
        while let Some(next) = next_phase(status) {
            let m = advance(&state, "m1", status, |_| {}).unwrap();
            assert_eq!(m.status, next);
            status = next;
        }
        assert_eq!(status, MigrationStatus::Completed);
        assert!(advance(&state, "m1", status, |_| {}).is_err());
    }

    #[test]
    fn advancing_from_wrong_phase_is_rejected() {
        let state = store_with(MigrationStatus::Scheduled, 3);
        let err = advance(&state, "m1", MigrationStatus::Transferring, |_| {}).unwrap_err();
        assert!(matches!(
            err,
            MigrateError::IllegalTransition { from: MigrationStatus::Scheduled, .. }
        ));
    }

    #[test]
    fn failure_retries_until_budget_is_spent() {
        let state = store_with(MigrationStatus::Preparing, 2);

        let first = fail_and_retry(&state, "m1", MigrationStatus::Preparing, "boom", 500).unwrap();
        assert!(first.will_retry());
        assert_eq!(first.record().status, MigrationStatus::Scheduled);
        assert_eq!(first.record().retry_count, 1);
        assert_eq!(first.record().scheduled_at, 500);

        advance(&state, "m1", MigrationStatus::Scheduled, |_| {}).unwrap();
        let second = fail_and_retry(&state, "m1", MigrationStatus::Preparing, "boom", 900).unwrap();
        assert!(!second.will_retry());
        assert_eq!(second.record().status, MigrationStatus::Failed);
        assert_eq!(second.record().retry_count, 2);
        assert_eq!(second.record().last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn unpinned_target_is_forgotten_on_failure() {
        let state = store_with(MigrationStatus::Preparing, 3);
        state
            .update_migration("m1", |m| {
                m.target_node_id = Some("n2".to_string());
                m.target_ram_mb = 4096;
            })
            .unwrap();

        let outcome = fail_and_retry(&state, "m1", MigrationStatus::Preparing, "x", 0).unwrap();
        assert!(outcome.record().target_node_id.is_none());
        assert_eq!(outcome.record().target_ram_mb, 0);
    }

    #[test]
    fn missing_migration_is_reported() {
        let state = StateStore::open_in_memory().unwrap();
        assert!(matches!(
            retry(&state, "nope", 0).unwrap_err(),
            MigrateError::MigrationNotFound(_)
        ));
    }
}
