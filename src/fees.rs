//! Damage and loss fees, offset against the booking deposit.
//!
//! Pure arithmetic over validated lines. Nothing here touches the store.

use std::collections::{HashMap, HashSet};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::models::{BookingItem, ValidatedLine};

/// Operator-supplied per-unit fees for one product.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeOverride {
    #[serde(default, alias = "damage_fee")]
    pub damage_fee: Option<Decimal>,
    #[serde(default, alias = "lost_fee")]
    pub lost_fee: Option<Decimal>,
}

/// Overrides keyed by product id.
pub type FeeOverrides = HashMap<String, FeeOverride>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeLine {
    pub booking_item_id: String,
    pub product_id: String,
    pub product_name: String,
    pub damaged: u32,
    pub lost: u32,
    pub damage_fee_per_unit: Decimal,
    pub lost_fee_per_unit: Decimal,
    pub damage_charge: Decimal,
    pub lost_charge: Decimal,
    pub line_total: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeSummary {
    pub lines: Vec<FeeLine>,
    pub fee_total: Decimal,
    pub deposit: Decimal,
    pub deposit_applied: Decimal,
    /// `deposit - fee_total`; negative when the customer owes money.
    pub balance: Decimal,
    pub refund_due: Decimal,
    pub extra_payable: Decimal,
}

/// Compute fees for the damaged and lost units of a validated return.
///
/// The per-unit fee is the override when given, else the product's configured
/// fee, else the booking line's unit price. Lines with nothing damaged or
/// lost are left out of the breakdown.
pub fn compute_fees(
    items: &[BookingItem],
    lines: &[ValidatedLine],
    deposit: Decimal,
    overrides: &FeeOverrides,
) -> Result<FeeSummary, ValidationError> {
    validate_overrides(items, overrides)?;
    if deposit < Decimal::ZERO {
        return Err(ValidationError::Invalid(format!(
            "Deposit cannot be negative: {deposit}"
        )));
    }

    let mut fee_lines = Vec::new();
    let mut fee_total = Decimal::ZERO;

    for line in lines {
        let b = line.buckets;
        if b.damaged == 0 && b.lost == 0 {
            continue;
        }

        let item = items.iter().find(|i| i.id == line.booking_item_id);
        let product_name = item.map(|i| i.product_name.clone()).unwrap_or_default();
        let ovr = overrides.get(&line.product_id).copied().unwrap_or_default();

        let damage_fee_per_unit = ovr
            .damage_fee
            .or_else(|| item.and_then(|i| i.damage_fee))
            .unwrap_or(line.unit_price);
        let lost_fee_per_unit = ovr
            .lost_fee
            .or_else(|| item.and_then(|i| i.lost_fee))
            .unwrap_or(line.unit_price);

        let overflow = || ValidationError::InvalidFee {
            product_id: line.product_id.clone(),
            reason: "fee total is too large to compute".into(),
        };
        let damage_charge = damage_fee_per_unit
            .checked_mul(Decimal::from(b.damaged))
            .ok_or_else(overflow)?;
        let lost_charge = lost_fee_per_unit
            .checked_mul(Decimal::from(b.lost))
            .ok_or_else(overflow)?;
        let line_total = damage_charge.checked_add(lost_charge).ok_or_else(overflow)?;
        fee_total = fee_total.checked_add(line_total).ok_or_else(overflow)?;

        fee_lines.push(FeeLine {
            booking_item_id: line.booking_item_id.clone(),
            product_id: line.product_id.clone(),
            product_name,
            damaged: b.damaged,
            lost: b.lost,
            damage_fee_per_unit,
            lost_fee_per_unit,
            damage_charge,
            lost_charge,
            line_total,
        });
    }

    let deposit_applied = fee_total.min(deposit);
    let balance = deposit - fee_total;

    Ok(FeeSummary {
        lines: fee_lines,
        fee_total,
        deposit,
        deposit_applied,
        balance,
        refund_due: balance.max(Decimal::ZERO),
        extra_payable: (-balance).max(Decimal::ZERO),
    })
}

fn validate_overrides(items: &[BookingItem], overrides: &FeeOverrides) -> Result<(), ValidationError> {
    let known: HashSet<&str> = items.iter().map(|i| i.product_id.as_str()).collect();
    for (product_id, ovr) in overrides {
        if !known.contains(product_id.as_str()) {
            return Err(ValidationError::UnknownOverrideProduct(product_id.clone()));
        }
        for (label, fee) in [("damage fee", ovr.damage_fee), ("lost fee", ovr.lost_fee)] {
            if let Some(fee) = fee {
                if fee < Decimal::ZERO {
                    return Err(ValidationError::InvalidFee {
                        product_id: product_id.clone(),
                        reason: format!("{label} cannot be negative ({fee})"),
                    });
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Buckets;
    use rust_decimal_macros::dec;

    fn item(id: &str, price: Decimal, damage: Option<Decimal>, lost: Option<Decimal>) -> BookingItem {
        BookingItem {
            id: id.into(),
            booking_id: "b".into(),
            product_id: format!("p-{id}"),
            product_name: format!("Item {id}"),
            quantity: 5,
            delivered_quantity: 5,
            unit_price: price,
            total_price: price * dec!(5),
            damage_fee: damage,
            lost_fee: lost,
        }
    }

    fn validated(it: &BookingItem, buckets: Buckets) -> ValidatedLine {
        ValidatedLine {
            booking_item_id: it.id.clone(),
            product_id: it.product_id.clone(),
            quantity_delivered: it.delivered_quantity,
            buckets,
            unit_price: it.unit_price,
            damage_reason: None,
            lost_reason: None,
            notes: None,
        }
    }

    #[test]
    fn test_fee_total_and_deposit_offset() {
        let it = item("a", dec!(300), Some(dec!(500)), Some(dec!(800)));
        let line = validated(&it, Buckets { fresh: 2, damaged: 2, lost: 1, ..Default::default() });

        let s = compute_fees(&[it], &[line], dec!(1000), &FeeOverrides::new()).unwrap();
        assert_eq!(s.fee_total, dec!(1800));
        assert_eq!(s.deposit_applied, dec!(1000));
        assert_eq!(s.balance, dec!(-800));
        assert_eq!(s.refund_due, dec!(0));
        assert_eq!(s.extra_payable, dec!(800));
        assert_eq!(s.lines.len(), 1);
        assert_eq!(s.lines[0].damage_charge, dec!(1000));
    }

    #[test]
    fn test_unit_price_is_fallback_fee() {
        let it = item("b", dec!(450), None, None);
        let line = validated(&it, Buckets { used: 1, lost: 1, ..Default::default() });

        let s = compute_fees(&[it], &[line], dec!(2000), &FeeOverrides::new()).unwrap();
        assert_eq!(s.fee_total, dec!(450));
        assert_eq!(s.balance, dec!(1550));
        assert_eq!(s.refund_due, dec!(1550));
        assert_eq!(s.extra_payable, dec!(0));
    }

    #[test]
    fn test_override_wins_over_product_fee() {
        let it = item("a", dec!(300), Some(dec!(500)), None);
        let line = validated(&it, Buckets { damaged: 1, lost: 1, ..Default::default() });
        let mut overrides = FeeOverrides::new();
        overrides.insert(
            "p-a".into(),
            FeeOverride { damage_fee: Some(dec!(120)), lost_fee: None },
        );

        let s = compute_fees(&[it], &[line], dec!(0), &overrides).unwrap();
        assert_eq!(s.lines[0].damage_fee_per_unit, dec!(120));
        assert_eq!(s.lines[0].lost_fee_per_unit, dec!(300));
        assert_eq!(s.fee_total, dec!(420));
        assert_eq!(s.deposit_applied, dec!(0));
    }

    #[test]
    fn test_rejects_foreign_or_negative_overrides() {
        let it = item("a", dec!(300), None, None);
        let mut overrides = FeeOverrides::new();
        overrides.insert("p-other".into(), FeeOverride::default());
        let err = compute_fees(&[it.clone()], &[], dec!(0), &overrides).unwrap_err();
        assert_eq!(err, ValidationError::UnknownOverrideProduct("p-other".into()));

        let mut overrides = FeeOverrides::new();
        overrides.insert(
            "p-a".into(),
            FeeOverride { damage_fee: None, lost_fee: Some(dec!(-1)) },
        );
        let err = compute_fees(&[it], &[], dec!(0), &overrides).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidFee { .. }));
    }

    #[test]
    fn test_oversized_fee_is_rejected_not_panicking() {
        let it = item("a", dec!(300), None, None);
        let line = validated(&it, Buckets { fresh: 3, damaged: 2, ..Default::default() });
        let mut overrides = FeeOverrides::new();
        overrides.insert(
            "p-a".into(),
            FeeOverride { damage_fee: Some(Decimal::MAX), lost_fee: None },
        );
        let err = compute_fees(&[it.clone()], &[line], dec!(0), &overrides).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidFee { ref product_id, .. } if product_id == "p-a"));

        // Each line fits, the sum does not.
        let half = Decimal::MAX / dec!(2) + dec!(1);
        let a = BookingItem { unit_price: half, ..item("a", dec!(1), None, None) };
        let b = BookingItem { unit_price: half, ..item("b", dec!(1), None, None) };
        let lines = [
            validated(&a, Buckets { damaged: 1, ..Default::default() }),
            validated(&b, Buckets { lost: 1, ..Default::default() }),
        ];
        let err = compute_fees(&[a, b], &lines, dec!(0), &FeeOverrides::new()).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidFee { .. }));
    }

    #[test]
    fn test_is_deterministic() {
        let it = item("a", dec!(199.99), None, None);
        let line = validated(&it, Buckets { damaged: 3, lost: 2, ..Default::default() });
        let a = compute_fees(&[it.clone()], &[line.clone()], dec!(500), &FeeOverrides::new()).unwrap();
        let b = compute_fees(&[it], &[line], dec!(500), &FeeOverrides::new()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.fee_total, dec!(999.95));
    }
}
