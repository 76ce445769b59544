use anyhow::Result;
use filtersmith_rs::config::PredefinedFilter;
use filtersmith_rs::criteria::{Condition, NumericBound};
use filtersmith_rs::trade::TradeRecord;
use filtersmith_rs::{Combination, apply_filters, apply_predefined_filters};

fn trades_with_sizes(sizes: &[f64]) -> Vec<TradeRecord> {
    sizes
        .iter()
        .map(|&candle_size| TradeRecord {
            time: "09:00".into(),
            entered: true,
            candle_size,
            ..TradeRecord::default()
        })
        .collect()
}

fn sizes(trades: &[&TradeRecord]) -> Vec<f64> {
    trades.iter().map(|trade| trade.candle_size).collect()
}

#[test]
fn predefined_and_combination_bounds_agree() -> Result<()> {
    let trades = trades_with_sizes(&[1.99, 2.0, 2.01, 4.99, 5.0, 5.0001, 9.0]);
    let all: Vec<&TradeRecord> = trades.iter().collect();

    for bound in [
        NumericBound::between(2.0, 5.0),
        NumericBound::at_most(5.0),
        NumericBound::at_least(2.0),
        NumericBound::between(5.0, 5.0),
    ] {
        let predefined = apply_predefined_filters(
            trades.iter(),
            &[PredefinedFilter::NumericRange {
                column_header: "Candle_Size".into(),
                condition: bound,
            }],
        )?;

        let mut combination = Combination::new();
        combination.insert("Candle_Size", Condition::Range(bound));
        let (combined, lta) = apply_filters(&all, &combination)?;

        assert!(!lta);
        assert_eq!(sizes(&predefined), sizes(&combined), "bound {bound:?}");
        for trade in &combined {
            assert!(bound.contains(trade.candle_size));
        }
    }
    Ok(())
}

#[test]
fn both_ends_of_a_closed_bound_are_kept() -> Result<()> {
    let trades = trades_with_sizes(&[2.0, 5.0, 5.0001]);
    let all: Vec<&TradeRecord> = trades.iter().collect();
    let mut combination = Combination::new();
    combination.insert("Candle_Size", Condition::Range(NumericBound::between(2.0, 5.0)));
    let (kept, _) = apply_filters(&all, &combination)?;
    assert_eq!(sizes(&kept), vec![2.0, 5.0]);
    Ok(())
}

#[test]
fn unknown_combination_column_is_an_error() {
    let trades = trades_with_sizes(&[1.0]);
    let all: Vec<&TradeRecord> = trades.iter().collect();
    let mut combination = Combination::new();
    combination.insert("No_Such_Column", Condition::Range(NumericBound::at_most(1.0)));
    assert!(apply_filters(&all, &combination).is_err());
}
