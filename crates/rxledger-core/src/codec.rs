//! Datum encoding for the authoritative store.
//!
//! Datums travel as compact JSON strings. The field set and names are the
//! serde form of [`PrescriptionDatum`]; any store can hold them as text.

use crate::{Result, record::PrescriptionDatum};

pub fn encode_datum(datum: &PrescriptionDatum) -> Result<String> {
  Ok(serde_json::to_string(datum)?)
}

pub fn decode_datum(encoded: &str) -> Result<PrescriptionDatum> {
  Ok(serde_json::from_str(encoded)?)
}

#[cfg(test)]
mod tests {
  use uuid::Uuid;

  use super::*;
  use crate::{commitment::hash_identifier, record::ActorId};

  fn datum() -> PrescriptionDatum {
    PrescriptionDatum {
      prescription_id:    Uuid::new_v4(),
      patient_commitment: hash_identifier("patient-1", "salt").unwrap(),
      drug_id:            "DRUG-12345".into(),
      dosage:             "500mg twice daily".into(),
      quantity:           30,
      issuer:             ActorId::new("doctor"),
      issued_at:          1_699_123_456,
      expiry_at:          1_701_715_456,
      refills_remaining:  2,
      metadata_ref:       Some("enc://meta/1".into()),
      continued_at:       Some(1_699_200_000),
    }
  }

  #[test]
  fn roundtrip_full_record() {
    let d = datum();
    assert_eq!(decode_datum(&encode_datum(&d).unwrap()).unwrap(), d);
  }

  #[test]
  fn roundtrip_boundary_values() {
    let d = PrescriptionDatum {
      quantity: 1,
      refills_remaining: 0,
      metadata_ref: None,
      continued_at: None,
      ..datum()
    };
    assert_eq!(decode_datum(&encode_datum(&d).unwrap()).unwrap(), d);
  }

  #[test]
  fn decode_rejects_negative_refills() {
    let mut value = serde_json::to_value(datum()).unwrap();
    value["refills_remaining"] = serde_json::json!(-1);
    assert!(decode_datum(&value.to_string()).is_err());
  }

  #[test]
  fn decode_rejects_garbage() {
    assert!(decode_datum("not json").is_err());
    assert!(decode_datum("{}").is_err());
  }
}
