//! A single (email, phone number) sighting handed to the engine.

use serde::Deserialize;

use crate::error::StorageError;

/// Parsed identify input. At least one side is always present.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawObservation")]
pub struct Observation {
    email: Option<String>,
    phone_number: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawObservation {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    phone_number: Option<String>,
}

impl TryFrom<RawObservation> for Observation {
    type Error = StorageError;

    fn try_from(raw: RawObservation) -> Result<Self, Self::Error> {
        Observation::new(raw.email, raw.phone_number)
    }
}

impl Observation {
    /// Blank values count as absent.
    pub fn new(email: Option<String>, phone_number: Option<String>) -> Result<Self, StorageError> {
        let email = present(email);
        let phone_number = present(phone_number);

        if email.is_none() && phone_number.is_none() {
            return Err(StorageError::InvalidInput(
                "At least one of email or phoneNumber must be provided".into(),
            ));
        }

        Ok(Self { email, phone_number })
    }

    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    pub fn phone_number(&self) -> Option<&str> {
        self.phone_number.as_deref()
    }
}

fn present(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
