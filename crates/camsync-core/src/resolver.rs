//! Per-patient move resolution
//!
//! Given the requested session mode and each patient's policy compliance,
//! decide what happens to that patient's data. Resolution is pure and runs
//! before any network transfer: a session with any rejected patient never
//! uploads anything.
//!
//! The one rule no mode or flag can override: a patient who meets the upload
//! policy but not the finalize policy is copied, never moved.

use crate::error::{Result, SyncError};
use crate::models::{Patient, SessionMode};
use crate::policy::{IdPolicy, PatientFacts};

/// What the session will do with one patient's data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatientAction {
    /// Upload a copy; records stay on the device and stay open server-side
    CopyUnfinished,
    /// Upload and close out server-side; delete locally
    MoveFinished,
    /// As `MoveFinished`, plus the patient record itself goes
    MoveAll,
    /// Move task data, keep the patient reduced to identifying fields
    MoveTasksKeepPatientShell,
}

impl PatientAction {
    /// Does this action delete the patient's task data locally afterwards?
    #[must_use]
    pub const fn deletes_tasks(self) -> bool {
        !matches!(self, Self::CopyUnfinished)
    }

    /// Does the server need to preserve (finalize) this patient's records?
    #[must_use]
    pub const fn finalizes(self) -> bool {
        self.deletes_tasks()
    }
}

/// Why a patient cannot be part of this session at all
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Fails the server's upload policy
    UploadPolicy,
    /// Shares an ID number value with another local patient
    IdClash,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UploadPolicy => write!(formatter, "does not meet the upload ID policy"),
            Self::IdClash => write!(formatter, "ID number clashes with another patient"),
        }
    }
}

/// One rejected patient, for failure reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatientRejection {
    pub patient_pk: i64,
    pub description: String,
    pub reason: RejectReason,
}

impl std::fmt::Display for PatientRejection {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{} ({})", self.description, self.reason)
    }
}

/// The resolved plan for one patient
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatientResolution {
    pub patient_pk: i64,
    pub description: String,
    pub action: PatientAction,
    /// True when a requested move was demoted for failing the finalize policy
    pub demoted: bool,
}

/// Resolve every patient, or fail with the full rejection list.
///
/// Rejections are collected across all patients before failing, so the report
/// names every offender rather than the first.
pub fn resolve(
    mode: SessionMode,
    patients: &[Patient],
    upload_policy: &IdPolicy,
    finalize_policy: &IdPolicy,
) -> Result<Vec<PatientResolution>> {
    let clashing = clashing_patient_pks(patients);
    let mut rejections = Vec::new();
    let mut resolutions = Vec::new();

    for patient in patients {
        let facts = PatientFacts::from(patient);

        if !upload_policy.complies(&facts) {
            rejections.push(PatientRejection {
                patient_pk: patient.pk,
                description: patient.description(),
                reason: RejectReason::UploadPolicy,
            });
            continue;
        }
        if clashing.contains(&patient.pk) {
            rejections.push(PatientRejection {
                patient_pk: patient.pk,
                description: patient.description(),
                reason: RejectReason::IdClash,
            });
            continue;
        }

        let finalizable = finalize_policy.complies(&facts);
        let wants_move = match mode {
            SessionMode::Copy => patient.move_off_device,
            SessionMode::Move | SessionMode::KeepPatientsAndMove => true,
        };
        let (action, demoted) = if !wants_move {
            (PatientAction::CopyUnfinished, false)
        } else if !finalizable {
            (PatientAction::CopyUnfinished, true)
        } else {
            match mode {
                SessionMode::Move => (PatientAction::MoveAll, false),
                SessionMode::KeepPatientsAndMove => {
                    (PatientAction::MoveTasksKeepPatientShell, false)
                }
                SessionMode::Copy => (PatientAction::MoveFinished, false),
            }
        };
        if demoted {
            tracing::warn!(
                patient = %patient.description(),
                "patient does not meet the finalize policy; copying instead of moving"
            );
        }
        resolutions.push(PatientResolution {
            patient_pk: patient.pk,
            description: patient.description(),
            action,
            demoted,
        });
    }

    if rejections.is_empty() {
        Ok(resolutions)
    } else {
        Err(SyncError::PatientsRejected(rejections))
    }
}

/// Patients whose (ID type, value) pairs collide with another patient's
fn clashing_patient_pks(patients: &[Patient]) -> Vec<i64> {
    let mut clashing = Vec::new();
    for (index, patient) in patients.iter().enumerate() {
        let collides = patients.iter().enumerate().any(|(other_index, other)| {
            other_index != index
                && patient
                    .id_numbers
                    .iter()
                    .any(|(which, value)| other.id_numbers.get(which) == Some(value))
        });
        if collides {
            clashing.push(patient.pk);
        }
    }
    clashing
}
