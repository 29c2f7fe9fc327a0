use super::*;
use crate::client::mock::MockApi;
use crate::model::events::BalanceChange;
use crate::report::MemoryReport;
use arbtest::arbtest;
use chrono::NaiveDate;
use std::rc::Rc;
use tracing_test::traced_test;

const ISSUER: &str = "rvYAfWj5gh67oV6fW32ZzP3Aw4Eubs59B";

fn asset() -> AssetId {
    format!("FOO/{ISSUER}").parse().unwrap()
}

fn base() -> AssetId {
    format!("USD/{ISSUER}").parse().unwrap()
}

fn event(index: usize, amount: Decimal) -> AccountEvent {
    AccountEvent {
        nick: Rc::from("alpha"),
        account: format!("r{}", "A".repeat(30)).parse().unwrap(),
        change: BalanceChange {
            tx_hash: TxHash::from(format!("T{index}").as_str()),
            ledger_index: index as u32 + 1,
            tx_index: 0,
            executed_time: "2019-03-01T12:00:00Z".parse().unwrap(),
            currency: "FOO".to_string(),
            counterparty: Some(ISSUER.parse().unwrap()),
            amount_change: amount,
            final_balance: Decimal::ZERO,
            kind: ChangeKind::Exchange,
        },
    }
}

/// Run one random credit/debit sequence through the engine and return the
/// remaining inventory and lifetime summary.
fn run(ops: &[(bool, u16)], discipline: BasisDiscipline) -> (Decimal, Option<PeriodSummary>) {
    let mut api = MockApi::default();
    api.rates.insert(
        (
            asset().to_string(),
            NaiveDate::from_ymd_opt(2019, 3, 1).unwrap(),
        ),
        "2.5".parse().unwrap(),
    );

    let mut sink = MemoryReport::default();
    let annotations = Annotations::default();
    let mut ledger = CostBasisLedger::new(
        &api,
        &mut sink,
        base(),
        discipline,
        &annotations,
        LedgerOptions::default(),
    );

    let target = asset();
    for (index, &(is_credit, quantity)) in ops.iter().enumerate() {
        let quantity = Decimal::from(quantity);
        let amount = if is_credit { quantity } else { -quantity };
        ledger
            .process_group(&TxGroup {
                events: vec![event(index, amount)],
            })
            .unwrap();
    }
    let remaining = ledger.remaining(&target);

    (remaining, ledger.finish().lifetime)
}

// Conservation: everything credited minus everything actually covered
// equals what remains, exactly, no matter the discipline. Disciplines may
// disagree on gains but never on quantities or credit/debit totals.
#[test]
#[traced_test]
fn prop_test_inventory_conservation() {
    arbtest(|u| {
        let ops: Vec<(bool, u16)> = u.arbitrary()?;

        // Reference simulation of the inventory level.
        let mut available = Decimal::ZERO;
        for &(is_credit, quantity) in &ops {
            let quantity = Decimal::from(quantity);
            if is_credit {
                available += quantity;
            } else {
                available -= quantity.min(available);
            }
        }

        let (fifo_remaining, fifo_summary) = run(&ops, BasisDiscipline::Fifo);
        let (lifo_remaining, lifo_summary) = run(&ops, BasisDiscipline::Lifo);

        assert_eq!(fifo_remaining, available);
        assert_eq!(lifo_remaining, available);

        let fifo_summary = fifo_summary.unwrap();
        let lifo_summary = lifo_summary.unwrap();
        assert_eq!(fifo_summary.credit, lifo_summary.credit);
        assert_eq!(fifo_summary.debit, lifo_summary.debit);

        Ok(())
    });
}
