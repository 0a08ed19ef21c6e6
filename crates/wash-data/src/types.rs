//! Type definitions for value-transfer records.

use serde::{Deserialize, Serialize};

use crate::error::DataError;

/// One value transfer between two addresses.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    /// Sender address.
    pub from_address: String,
    /// Recipient address.
    pub to_address: String,
    /// Amount moved. Must be finite and non-negative.
    pub value: f64,
    /// Transaction id (hash). Not required to be unique.
    pub tx_id: String,
    /// Opaque timestamp, carried as metadata only.
    pub timestamp: String,
}

impl TransferRecord {
    /// Convenience constructor used by loaders and tests.
    pub fn new(
        from_address: impl Into<String>,
        to_address: impl Into<String>,
        value: f64,
        tx_id: impl Into<String>,
        timestamp: impl Into<String>,
    ) -> Self {
        Self {
            from_address: from_address.into(),
            to_address: to_address.into(),
            value,
            tx_id: tx_id.into(),
            timestamp: timestamp.into(),
        }
    }

    /// Check that every required field is present and the value is usable.
    ///
    /// `record` is the zero-based input position, reported back in errors.
    ///
    /// # Errors
    /// Returns [`DataError`] naming the first violated field.
    pub fn validate(&self, record: usize) -> Result<(), DataError> {
        let required = [
            ("from_address", &self.from_address),
            ("to_address", &self.to_address),
            ("tx_id", &self.tx_id),
            ("timestamp", &self.timestamp),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(DataError::MissingField { record, field });
            }
        }

        if !self.value.is_finite() {
            return Err(DataError::NonFiniteValue { record });
        }
        if self.value < 0.0 {
            return Err(DataError::NegativeValue {
                record,
                value: self.value,
            });
        }
        Ok(())
    }

    /// Evidence identity of this record: `{tx_id, value}`.
    pub fn evidence(&self) -> EvidenceTx {
        EvidenceTx {
            tx_id: self.tx_id.clone(),
            value: self.value,
        }
    }
}

/// Transaction evidence kept per blacklisted address.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvidenceTx {
    /// Transaction id.
    pub tx_id: String,
    /// Transferred value.
    pub value: f64,
}

impl EvidenceTx {
    /// Hashable identity. `f64` is not `Eq`, so the value is keyed by its bits.
    pub fn key(&self) -> (String, u64) {
        (self.tx_id.clone(), self.value.to_bits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(value: f64) -> TransferRecord {
        TransferRecord::new("0xa", "0xb", value, "0x01", "1700000000")
    }

    #[test]
    fn valid_record_passes() {
        assert!(rec(10.0).validate(0).is_ok());
        assert!(rec(0.0).validate(0).is_ok());
    }

    #[test]
    fn negative_value_rejected() {
        let err = rec(-1.0).validate(7).unwrap_err();
        assert!(matches!(err, DataError::NegativeValue { record: 7, .. }));
    }

    #[test]
    fn nan_and_infinite_rejected() {
        assert!(matches!(
            rec(f64::NAN).validate(0),
            Err(DataError::NonFiniteValue { record: 0 })
        ));
        assert!(matches!(
            rec(f64::INFINITY).validate(1),
            Err(DataError::NonFiniteValue { record: 1 })
        ));
    }

    #[test]
    fn blank_field_names_the_field() {
        let mut r = rec(1.0);
        r.to_address = "  ".to_string();
        let err = r.validate(3).unwrap_err();
        assert!(matches!(
            err,
            DataError::MissingField {
                record: 3,
                field: "to_address"
            }
        ));
        assert!(err.to_string().contains("to_address"));
    }

    #[test]
    fn evidence_key_distinguishes_value() {
        let a = TransferRecord::new("a", "b", 1.0, "tx", "t").evidence();
        let b = TransferRecord::new("a", "b", 2.0, "tx", "t").evidence();
        assert_ne!(a.key(), b.key());
        assert_eq!(a.key(), a.clone().key());
    }
}
