//! Medical record types

use crate::auth::UserId;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Store-assigned record identifier
pub type RecordId = i64;

/// A clinical record; `doctor_id` is the owning physician
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MedicalRecord {
    pub record_id: RecordId,
    pub patient_id: i64,
    pub doctor_id: Option<UserId>,
    pub diagnosis: String,
    pub treatment: Option<String>,
    pub prescription: Option<String>,
    pub notes: Option<String>,
    pub record_date: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for a new record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMedicalRecord {
    pub patient_id: i64,
    #[serde(default)]
    pub doctor_id: Option<UserId>,
    pub diagnosis: String,
    #[serde(default)]
    pub treatment: Option<String>,
    #[serde(default)]
    pub prescription: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    /// Defaults to today
    #[serde(default)]
    pub record_date: Option<NaiveDate>,
}

/// Partial update; only `Some` fields are written
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MedicalRecordUpdate {
    #[serde(default)]
    pub diagnosis: Option<String>,
    #[serde(default)]
    pub treatment: Option<String>,
    #[serde(default)]
    pub prescription: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl MedicalRecordUpdate {
    pub fn is_empty(&self) -> bool {
        self.diagnosis.is_none()
            && self.treatment.is_none()
            && self.prescription.is_none()
            && self.notes.is_none()
    }

    /// Apply the set fields to `record`
    pub fn apply(&self, record: &mut MedicalRecord, now: DateTime<Utc>) {
        if let Some(diagnosis) = &self.diagnosis {
            record.diagnosis = diagnosis.clone();
        }
        if let Some(treatment) = &self.treatment {
            record.treatment = Some(treatment.clone());
        }
        if let Some(prescription) = &self.prescription {
            record.prescription = Some(prescription.clone());
        }
        if let Some(notes) = &self.notes {
            record.notes = Some(notes.clone());
        }
        record.updated_at = now;
    }
}

/// Outcome of an ownership-checked record update
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordWrite {
    Applied(MedicalRecord),
    NotFound,
    /// The record exists but belongs to another doctor
    NotOwner,
}
