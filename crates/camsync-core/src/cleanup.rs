//! Post-upload local cleanup
//!
//! Runs only after the server has durably accepted the session's records.
//! Every step is safe to re-run: an interruption part-way through leaves a
//! state from which a second pass finishes the job without error.

use crate::error::Result;
use crate::models::SessionMode;
use crate::resolver::{PatientAction, PatientResolution};
use crate::store::{LocalStore, BLOB_TABLE, PATIENT_IDNUM_TABLE, PATIENT_TABLE};

/// What a cleanup pass changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub task_rows_deleted: usize,
    pub patients_deleted: usize,
    pub patients_reduced_to_shell: usize,
    pub blobs_pruned: usize,
    pub move_off_flags_cleared: usize,
}

/// Reconcile local state with what the server now holds.
///
/// Task data belonging to moved patients is deleted; "keep patient shell"
/// patients are stripped to identifying fields; anonymous task rows go when
/// the session moved them or they were individually flagged; orphaned blobs
/// are swept last.
pub fn finalize(
    store: &dyn LocalStore,
    mode: SessionMode,
    resolutions: &[PatientResolution],
) -> Result<CleanupReport> {
    let mut report = CleanupReport::default();
    let task_tables: Vec<String> = store
        .client_tables()?
        .into_iter()
        .filter(|table| {
            table != PATIENT_TABLE && table != PATIENT_IDNUM_TABLE && table != BLOB_TABLE
        })
        .collect();

    for resolution in resolutions {
        if !resolution.action.deletes_tasks() {
            continue;
        }
        for table in &task_tables {
            report.task_rows_deleted +=
                store.delete_rows_for_patient(table, resolution.patient_pk)?;
        }
        match resolution.action {
            PatientAction::MoveAll | PatientAction::MoveFinished => {
                store.delete_rows_for_patient(PATIENT_IDNUM_TABLE, resolution.patient_pk)?;
                report.patients_deleted +=
                    store.delete_rows(PATIENT_TABLE, &[resolution.patient_pk])?;
            }
            PatientAction::MoveTasksKeepPatientShell => {
                report.patients_reduced_to_shell +=
                    store.reduce_patient_to_shell(resolution.patient_pk)?;
            }
            PatientAction::CopyUnfinished => {}
        }
    }

    // Anonymous tasks: all of them in a moving session, flagged ones always.
    for table in &task_tables {
        let flagged: Vec<i64> = store
            .task_records(table)?
            .into_iter()
            .filter(|record| {
                record.patient_pk.is_none() && (mode.is_finalizing() || record.move_off_device)
            })
            .map(|record| record.pk)
            .collect();
        report.task_rows_deleted += store.delete_rows(table, &flagged)?;
    }

    report.blobs_pruned = store.prune_dead_blobs()?;

    // Flags on rows kept by an unfinished patient stay set; the move request
    // carries over to the next session.
    let unfinished: Vec<i64> = resolutions
        .iter()
        .filter(|resolution| resolution.action == PatientAction::CopyUnfinished)
        .map(|resolution| resolution.patient_pk)
        .collect();
    for table in store.client_tables()? {
        report.move_off_flags_cleared += store.clear_move_off_flags_except(&table, &unfinished)?;
    }

    tracing::info!(?report, "local cleanup complete");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::store::test_support::open_test_db;
    use crate::store::SqliteStore;

    fn resolution(patient_pk: i64, action: PatientAction) -> PatientResolution {
        PatientResolution {
            patient_pk,
            description: format!("patient #{patient_pk}"),
            action,
            demoted: false,
        }
    }

    fn seed(conn: &rusqlite::Connection) {
        conn.execute_batch(
            "INSERT INTO patient (id, forename, surname, email, _move_off_device)
                 VALUES (1, 'J', 'Smith', 'j@x', 0), (2, 'M', 'Jones', 'm@x', 0);
             INSERT INTO patient_idnum (id, patient_id, which_idnum, idnum_value)
                 VALUES (1, 1, 1, 100), (2, 2, 1, 200);
             INSERT INTO phq9 (id, patient_id, _move_off_device)
                 VALUES (1, 1, 1), (2, 2, 1), (3, NULL, 1), (4, NULL, 0);
             INSERT INTO blobs (id, src_table, src_pk, src_field, data)
                 VALUES (1, 'phq9', 1, 'photo', X'AB'), (2, 'phq9', 4, 'photo', X'CD');",
        )
        .unwrap();
    }

    #[test]
    fn move_all_deletes_patient_tasks_and_orphaned_blobs() {
        let conn = open_test_db();
        seed(&conn);
        let store = SqliteStore::new(&conn);
        let report = finalize(
            &store,
            SessionMode::Move,
            &[
                resolution(1, PatientAction::MoveAll),
                resolution(2, PatientAction::MoveAll),
            ],
        )
        .unwrap();

        // Patients, their idnums, their tasks, and all anonymous tasks go.
        assert_eq!(store.row_count("patient").unwrap(), 0);
        assert_eq!(store.row_count("patient_idnum").unwrap(), 0);
        assert_eq!(store.row_count("phq9").unwrap(), 0);
        // Both blobs pointed at deleted phq9 rows.
        assert_eq!(report.blobs_pruned, 2);
        assert_eq!(store.row_count("blobs").unwrap(), 0);
    }

    #[test]
    fn keep_shell_retains_reduced_patient() {
        let conn = open_test_db();
        seed(&conn);
        let store = SqliteStore::new(&conn);
        finalize(
            &store,
            SessionMode::KeepPatientsAndMove,
            &[
                resolution(1, PatientAction::MoveTasksKeepPatientShell),
                resolution(2, PatientAction::MoveTasksKeepPatientShell),
            ],
        )
        .unwrap();

        let patients = store.patients().unwrap();
        assert_eq!(patients.len(), 2);
        assert_eq!(patients[0].surname.as_deref(), Some("Smith"));
        assert_eq!(patients[0].email, None);
        // Identifying ID numbers stay with the shell.
        assert_eq!(patients[0].id_numbers[&1], 100);
        assert_eq!(store.row_count("phq9").unwrap(), 0);
    }

    #[test]
    fn copy_mode_deletes_only_flagged_anonymous_tasks() {
        let conn = open_test_db();
        seed(&conn);
        let store = SqliteStore::new(&conn);
        let report = finalize(
            &store,
            SessionMode::Copy,
            &[
                resolution(1, PatientAction::CopyUnfinished),
                resolution(2, PatientAction::CopyUnfinished),
            ],
        )
        .unwrap();

        // Patient-owned rows stay; anonymous row 3 (flagged) goes, row 4 stays.
        assert_eq!(store.pk_values("phq9").unwrap(), vec![1, 2, 4]);
        assert_eq!(store.row_count("patient").unwrap(), 2);
        // Per-record move requests on kept patients carry over untouched.
        assert_eq!(report.move_off_flags_cleared, 0);
        let flagged: Vec<i64> = store
            .task_records("phq9")
            .unwrap()
            .into_iter()
            .filter(|record| record.move_off_device)
            .map(|record| record.pk)
            .collect();
        assert_eq!(flagged, vec![1, 2]);
    }

    #[test]
    fn unfinished_patient_keeps_its_move_requests() {
        let conn = open_test_db();
        seed(&conn);
        // Patient 1 asked to move but was kept back by the finalize policy.
        conn.execute("UPDATE patient SET _move_off_device = 1 WHERE id = 1", [])
            .unwrap();
        let store = SqliteStore::new(&conn);
        let report = finalize(
            &store,
            SessionMode::Move,
            &[
                resolution(1, PatientAction::CopyUnfinished),
                resolution(2, PatientAction::MoveAll),
            ],
        )
        .unwrap();

        // Patient 2 and the anonymous rows are gone; patient 1's flagged task
        // and the patient-level flag survive for the next session.
        assert_eq!(store.pk_values("phq9").unwrap(), vec![1]);
        assert!(store.task_records("phq9").unwrap()[0].move_off_device);
        let patients = store.patients().unwrap();
        assert_eq!(patients.len(), 1);
        assert!(patients[0].move_off_device);
        assert_eq!(report.move_off_flags_cleared, 0);
    }

    #[test]
    fn finalize_twice_changes_nothing_the_second_time() {
        let conn = open_test_db();
        seed(&conn);
        let store = SqliteStore::new(&conn);
        let resolutions = [
            resolution(1, PatientAction::MoveAll),
            resolution(2, PatientAction::MoveTasksKeepPatientShell),
        ];

        finalize(&store, SessionMode::Move, &resolutions).unwrap();
        let second = finalize(&store, SessionMode::Move, &resolutions).unwrap();

        assert_eq!(second, CleanupReport::default());
    }
}
