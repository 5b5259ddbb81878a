//! Market event record and its wire decoder.

use serde::Deserialize;

use crate::error::DecodeError;

/// One decoded market order. Immutable once decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketEvent {
    pub item_id: String,
    /// Quality tier, 1..=5
    pub quality: u8,
    /// Total transaction price
    pub price: f64,
    /// Quantity traded, always > 0
    pub amount: u64,
}

impl MarketEvent {
    /// Price per unit traded.
    pub fn unit_price(&self) -> f64 {
        self.price / self.amount as f64
    }
}

/// Wire shape. Signed integers so out-of-range values are reported instead of
/// failing inside serde with a less useful message.
#[derive(Deserialize)]
struct WireEvent {
    item_id: String,
    quality: i64,
    price: f64,
    amount: i64,
}

/// Decode one JSON payload into a validated [`MarketEvent`].
///
/// Unknown fields are ignored. Missing or mistyped required fields are
/// rejected rather than defaulted.
pub fn decode(raw: &[u8]) -> Result<MarketEvent, DecodeError> {
    let wire: WireEvent = serde_json::from_slice(raw)?;

    if wire.item_id.trim().is_empty() {
        return Err(DecodeError::EmptyItemId);
    }
    let quality = match u8::try_from(wire.quality) {
        Ok(q @ 1..=5) => q,
        _ => return Err(DecodeError::QualityOutOfRange(wire.quality)),
    };
    if !wire.price.is_finite() || wire.price < 0.0 {
        return Err(DecodeError::InvalidPrice(wire.price));
    }
    if wire.amount <= 0 {
        return Err(DecodeError::NonPositiveAmount(wire.amount));
    }

    Ok(MarketEvent {
        item_id: wire.item_id,
        quality,
        price: wire.price,
        amount: wire.amount as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_valid_event() {
        let raw = br#"{"item_id":"T4_BAG","quality":4,"price":100,"amount":2}"#;
        let event = decode(raw).unwrap();
        assert_eq!(event.item_id, "T4_BAG");
        assert_eq!(event.quality, 4);
        assert_eq!(event.price, 100.0);
        assert_eq!(event.amount, 2);
        assert_eq!(event.unit_price(), 50.0);
    }

    #[test]
    fn test_decode_ignores_unknown_fields() {
        let raw = br#"{"Id":991,"item_id":"T5_CAPE@1","quality":3,"price":12.5,"amount":5,"LocationId":3005}"#;
        let event = decode(raw).unwrap();
        assert_eq!(event.item_id, "T5_CAPE@1");
        assert_eq!(event.amount, 5);
    }

    #[test]
    fn test_decode_rejects_zero_amount() {
        let raw = br#"{"item_id":"T4_BAG","quality":4,"price":100,"amount":0}"#;
        let err = decode(raw).unwrap_err();
        assert!(matches!(err, DecodeError::NonPositiveAmount(0)));
        assert_eq!(err.reason(), "non_positive_amount");
    }

    #[test]
    fn test_decode_rejects_negative_amount() {
        let raw = br#"{"item_id":"T4_BAG","quality":4,"price":100,"amount":-3}"#;
        assert!(matches!(
            decode(raw),
            Err(DecodeError::NonPositiveAmount(-3))
        ));
    }

    #[test]
    fn test_decode_rejects_missing_field() {
        let raw = br#"{"item_id":"T4_BAG","quality":4,"price":100}"#;
        assert!(matches!(decode(raw), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_decode_rejects_non_numeric_field() {
        let raw = br#"{"item_id":"T4_BAG","quality":4,"price":"100","amount":2}"#;
        assert!(matches!(decode(raw), Err(DecodeError::Malformed(_))));

        let raw = br#"{"item_id":"T4_BAG","quality":null,"price":100,"amount":2}"#;
        assert!(matches!(decode(raw), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_decode_rejects_fractional_amount() {
        let raw = br#"{"item_id":"T4_BAG","quality":4,"price":100,"amount":1.5}"#;
        assert!(matches!(decode(raw), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_decode_rejects_quality_out_of_range() {
        for quality in [0, 6, -1, 300] {
            let raw = format!(
                r#"{{"item_id":"T4_BAG","quality":{},"price":100,"amount":2}}"#,
                quality
            );
            let err = decode(raw.as_bytes()).unwrap_err();
            assert!(
                matches!(err, DecodeError::QualityOutOfRange(q) if q == quality),
                "quality {} should be rejected, got {:?}",
                quality,
                err
            );
        }
    }

    #[test]
    fn test_decode_rejects_negative_price() {
        let raw = br#"{"item_id":"T4_BAG","quality":4,"price":-1,"amount":2}"#;
        assert!(matches!(decode(raw), Err(DecodeError::InvalidPrice(_))));
    }

    #[test]
    fn test_decode_accepts_zero_price() {
        let raw = br#"{"item_id":"T4_BAG","quality":4,"price":0,"amount":2}"#;
        assert_eq!(decode(raw).unwrap().unit_price(), 0.0);
    }

    #[test]
    fn test_decode_rejects_blank_item_id() {
        let raw = br#"{"item_id":"  ","quality":4,"price":1,"amount":2}"#;
        assert!(matches!(decode(raw), Err(DecodeError::EmptyItemId)));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode(b"not json"), Err(DecodeError::Malformed(_))));
        assert!(matches!(decode(b""), Err(DecodeError::Malformed(_))));
        assert_eq!(decode(b"[]").unwrap_err().reason(), "malformed");
    }
}
