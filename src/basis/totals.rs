//! Running totals normalized to the base asset, with period rollover.
use crate::report::{PeriodKind, PeriodSummary};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use super::GainTerm;

pub(crate) fn month_key(when: DateTime<Utc>) -> String {
    when.format("%Y-%m").to_string()
}

pub(crate) fn year_key(when: DateTime<Utc>) -> String {
    when.format("%Y").to_string()
}

/// One accumulator per reporting scope. The period key is `None` until the
/// first tally; lifetime accumulators keep a fixed key and never roll over.
#[derive(Debug)]
pub(crate) struct Accumulator {
    kind: PeriodKind,
    period: Option<String>,
    credit: Decimal,
    debit: Decimal,
    fees: Decimal,
    short_term_gain: Decimal,
    long_term_gain: Decimal,
}

impl Accumulator {
    pub(crate) fn new(kind: PeriodKind) -> Self {
        let period = match kind {
            PeriodKind::Lifetime => Some("all time".to_string()),
            PeriodKind::Month | PeriodKind::Year => None,
        };

        Self {
            kind,
            period,
            credit: Decimal::ZERO,
            debit: Decimal::ZERO,
            fees: Decimal::ZERO,
            short_term_gain: Decimal::ZERO,
            long_term_gain: Decimal::ZERO,
        }
    }

    /// Close the previous period if `key` starts a new one. The closed
    /// period's summary must be emitted before any tally lands in the new
    /// period.
    pub(crate) fn rollover(&mut self, key: &str) -> Option<PeriodSummary> {
        debug_assert!(self.kind != PeriodKind::Lifetime);

        match self.period.as_deref() {
            Some(period) if period == key => None,
            Some(_) => {
                let closed = self.summary();
                self.period = Some(key.to_string());
                self.credit = Decimal::ZERO;
                self.debit = Decimal::ZERO;
                self.fees = Decimal::ZERO;
                self.short_term_gain = Decimal::ZERO;
                self.long_term_gain = Decimal::ZERO;

                closed
            }
            None => {
                self.period = Some(key.to_string());

                None
            }
        }
    }

    pub(crate) fn credit(&mut self, value: Decimal) {
        self.credit += value;
    }

    pub(crate) fn debit(&mut self, value: Decimal) {
        self.debit += value;
    }

    pub(crate) fn fee(&mut self, value: Decimal) {
        self.fees += value;
    }

    pub(crate) fn gain(&mut self, term: GainTerm, value: Decimal) {
        match term {
            GainTerm::Short => self.short_term_gain += value,
            GainTerm::Long => self.long_term_gain += value,
        }
    }

    /// Summary of the period in progress, or `None` before the first tally.
    pub(crate) fn summary(&self) -> Option<PeriodSummary> {
        self.period.as_ref().map(|period| PeriodSummary {
            kind: self.kind,
            period: period.clone(),
            credit: self.credit,
            debit: self.debit,
            fees: self.fees,
            short_term_gain: self.short_term_gain,
            long_term_gain: self.long_term_gain,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_period_keys() {
        let when: DateTime<Utc> = "2018-04-03T17:52:20Z".parse().unwrap();

        assert_eq!(month_key(when), "2018-04");
        assert_eq!(year_key(when), "2018");
    }

    #[test]
    fn test_first_tally_does_not_emit() {
        let mut acc = Accumulator::new(PeriodKind::Month);

        assert!(acc.rollover("2018-04").is_none());
        acc.credit(Decimal::ONE);
        assert!(acc.rollover("2018-04").is_none());
    }

    #[test]
    fn test_rollover_emits_closed_period_and_resets() {
        let mut acc = Accumulator::new(PeriodKind::Month);
        acc.rollover("2018-04");
        acc.credit("10".parse().unwrap());
        acc.gain(GainTerm::Short, "3".parse().unwrap());

        let closed = acc.rollover("2018-05").unwrap();
        assert_eq!(closed.period, "2018-04");
        assert_eq!(closed.credit, "10".parse().unwrap());
        assert_eq!(closed.short_term_gain, "3".parse().unwrap());

        let open = acc.summary().unwrap();
        assert_eq!(open.period, "2018-05");
        assert_eq!(open.credit, Decimal::ZERO);
    }

    #[test]
    fn test_lifetime_summary_has_fixed_key() {
        let mut acc = Accumulator::new(PeriodKind::Lifetime);
        acc.debit("7".parse().unwrap());

        let summary = acc.summary().unwrap();
        assert_eq!(summary.period, "all time");
        assert_eq!(summary.debit, "7".parse().unwrap());
    }
}
