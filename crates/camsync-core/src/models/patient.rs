//! Patient model
//!
//! The sync subsystem validates patients against ID policies but never
//! mutates them; mutation belongs to the UI layer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::json;

/// A patient as the sync subsystem sees one: identifying attributes plus
/// assigned ID numbers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patient {
    /// Local primary key
    pub pk: i64,
    pub forename: Option<String>,
    pub surname: Option<String>,
    pub sex: Option<String>,
    /// ISO date of birth
    pub dob: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
    /// General practitioner details
    pub gp: Option<String>,
    pub other_details: Option<String>,
    /// Assigned ID numbers: ID type -> value
    pub id_numbers: BTreeMap<u16, i64>,
    /// Explicit per-patient "move off this device" request
    pub move_off_device: bool,
}

impl Patient {
    /// Short human description for failure reports
    #[must_use]
    pub fn description(&self) -> String {
        let name = match (self.surname.as_deref(), self.forename.as_deref()) {
            (Some(surname), Some(forename)) => format!("{surname}, {forename}"),
            (Some(surname), None) => surname.to_string(),
            (None, Some(forename)) => forename.to_string(),
            (None, None) => format!("patient #{}", self.pk),
        };
        if self.id_numbers.is_empty() {
            name
        } else {
            let ids = self
                .id_numbers
                .iter()
                .map(|(which, value)| format!("idnum{which}={value}"))
                .collect::<Vec<_>>()
                .join(", ");
            format!("{name} [{ids}]")
        }
    }

    /// JSON description sent to the server for `validate_patients`
    #[must_use]
    pub fn validation_json(&self, finalizing: bool) -> serde_json::Value {
        let idnums: serde_json::Map<String, serde_json::Value> = self
            .id_numbers
            .iter()
            .map(|(which, value)| (format!("idnum{which}"), json!(value)))
            .collect();
        json!({
            "id": self.pk,
            "forename": self.forename,
            "surname": self.surname,
            "sex": self.sex,
            "dob": self.dob,
            "email": self.email,
            "address": self.address,
            "gp": self.gp,
            "otherdetails": self.other_details,
            "idnums": idnums,
            "finalizing": finalizing,
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn description_prefers_name_then_pk() {
        let anonymous = Patient {
            pk: 7,
            ..Patient::default()
        };
        assert_eq!(anonymous.description(), "patient #7");

        let named = Patient {
            pk: 1,
            forename: Some("John".to_string()),
            surname: Some("Smith".to_string()),
            id_numbers: BTreeMap::from([(1, 555)]),
            ..Patient::default()
        };
        assert_eq!(named.description(), "Smith, John [idnum1=555]");
    }

    #[test]
    fn validation_json_carries_finalizing_flag_and_idnums() {
        let patient = Patient {
            pk: 3,
            surname: Some("Smith".to_string()),
            id_numbers: BTreeMap::from([(1, 555), (4, 9)]),
            ..Patient::default()
        };
        let value = patient.validation_json(true);
        assert_eq!(value["finalizing"], json!(true));
        assert_eq!(value["idnums"]["idnum1"], json!(555));
        assert_eq!(value["idnums"]["idnum4"], json!(9));
    }
}
