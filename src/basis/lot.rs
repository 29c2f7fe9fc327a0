//! Per-asset acquisition lots and the queue discipline that consumes them.
use crate::model::events::TxHash;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::VecDeque;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LotError {
    #[error("Cannot take a zero or negative quantity ({0})")]
    ZeroOrNegative(Decimal),
}

/// Which end of the inventory a disposal consumes first. Chosen once per
/// run and applied to every asset uniformly.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BasisDiscipline {
    Fifo,
    Lifo,
}

/// Where and when a lot was acquired.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Acquisition {
    pub tx_hash: TxHash,
    pub time: DateTime<Utc>,
}

/// A quantity of one asset acquired at a known normalized rate and not yet
/// fully disposed. `rate` is `None` when normalization failed at
/// acquisition time; the gap is carried forward so a later disposal can
/// report it instead of inventing a basis.
#[derive(Clone, Debug)]
pub struct Lot {
    pub quantity: Decimal,
    pub rate: Option<Decimal>,
    pub acquired: Acquisition,
}

impl Lot {
    /// Split off `take_quantity`, leaving the rest. Both halves keep the
    /// original rate and acquisition; only the quantity is prorated.
    fn split(self, take_quantity: Decimal) -> (Lot, Lot) {
        let take = Lot {
            quantity: take_quantity,
            rate: self.rate,
            acquired: self.acquired.clone(),
        };
        let leave = Lot {
            quantity: self.quantity - take_quantity,
            rate: self.rate,
            acquired: self.acquired,
        };

        (take, leave)
    }
}

/// The lots consumed by one disposal. `uncovered` is non-zero when the
/// queue ran dry before the disposal was fully matched.
#[derive(Debug)]
pub(crate) struct TakenLots {
    pub(crate) portions: Vec<Lot>,
    pub(crate) uncovered: Decimal,
}

/// Ordered queue of acquisition lots for one asset. Acquisitions append;
/// disposals pop from the end selected by the discipline, and a split
/// residual goes back to that same end.
#[derive(Debug)]
pub struct LotQueue {
    deq: VecDeque<Lot>,
    discipline: BasisDiscipline,
}

impl LotQueue {
    pub fn new(discipline: BasisDiscipline) -> Self {
        Self {
            deq: VecDeque::new(),
            discipline,
        }
    }

    pub fn push(&mut self, lot: Lot) {
        self.deq.push_back(lot);
    }

    fn pop(&mut self) -> Option<Lot> {
        match self.discipline {
            BasisDiscipline::Fifo => self.deq.pop_front(),
            BasisDiscipline::Lifo => self.deq.pop_back(),
        }
    }

    // intended sequence: pop; split -> (take, leave); consume take; unpop leave
    fn unpop(&mut self, lot: Lot) {
        match self.discipline {
            BasisDiscipline::Fifo => self.deq.push_front(lot),
            BasisDiscipline::Lifo => self.deq.push_back(lot),
        }
    }

    /// Sum of all remaining lot quantities.
    pub fn quantity(&self) -> Decimal {
        self.deq.iter().map(|lot| lot.quantity).sum()
    }

    pub fn len(&self) -> usize {
        self.deq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deq.is_empty()
    }

    /// Pop lots until `quantity` is covered, splitting the last lot when it
    /// only partially covers the remainder. Runs to completion once
    /// started; the disposal never leaves a half-applied split behind.
    pub(crate) fn take(&mut self, quantity: Decimal) -> Result<TakenLots, LotError> {
        if quantity <= Decimal::ZERO {
            return Err(LotError::ZeroOrNegative(quantity));
        }

        let mut portions = Vec::new();
        let mut so_far = Decimal::ZERO;

        while let Some(lot) = self.pop() {
            let sum = so_far + lot.quantity;

            match sum.cmp(&quantity) {
                std::cmp::Ordering::Equal => {
                    portions.push(lot);

                    return Ok(TakenLots {
                        portions,
                        uncovered: Decimal::ZERO,
                    });
                }
                std::cmp::Ordering::Greater => {
                    let (take, leave) = lot.split(quantity - so_far);
                    portions.push(take);
                    self.unpop(leave);

                    return Ok(TakenLots {
                        portions,
                        uncovered: Decimal::ZERO,
                    });
                }
                std::cmp::Ordering::Less => {
                    portions.push(lot);
                    so_far = sum;
                }
            }
        }

        // Queue exhausted. The caller decides whether the gap is a warning
        // or, under strict mode, fatal.
        Ok(TakenLots {
            portions,
            uncovered: quantity - so_far,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lot(quantity: &str, rate: &str, day: u32) -> Lot {
        Lot {
            quantity: quantity.parse().unwrap(),
            rate: Some(rate.parse().unwrap()),
            acquired: Acquisition {
                tx_hash: TxHash::from(format!("HASH{day:02}").as_str()),
                time: format!("2019-03-{day:02}T00:00:00Z").parse().unwrap(),
            },
        }
    }

    #[test]
    fn test_take_exact_sum_exhausts_both_lots() {
        let mut queue = LotQueue::new(BasisDiscipline::Fifo);
        queue.push(lot("100", "2.0", 1));
        queue.push(lot("50", "3.0", 2));

        let taken = queue.take("150".parse().unwrap()).unwrap();

        assert_eq!(taken.portions.len(), 2);
        assert_eq!(taken.uncovered, Decimal::ZERO);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_take_one_under_leaves_residual() {
        let mut queue = LotQueue::new(BasisDiscipline::Fifo);
        queue.push(lot("100", "2.0", 1));
        queue.push(lot("50", "3.0", 2));

        let taken = queue.take("149".parse().unwrap()).unwrap();

        assert_eq!(taken.portions.len(), 2);
        assert_eq!(taken.portions[1].quantity, "49".parse().unwrap());
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.quantity(), Decimal::ONE);

        // The residual keeps the split lot's rate and acquisition.
        let residual = queue.pop().unwrap();
        assert_eq!(residual.rate, Some("3.0".parse().unwrap()));
        assert_eq!(residual.acquired.tx_hash, TxHash::from("HASH02"));
    }

    #[test]
    fn test_lifo_consumes_newest_first() {
        let mut queue = LotQueue::new(BasisDiscipline::Lifo);
        queue.push(lot("100", "2.0", 1));
        queue.push(lot("50", "3.0", 2));

        let taken = queue.take("60".parse().unwrap()).unwrap();

        assert_eq!(taken.portions[0].acquired.tx_hash, TxHash::from("HASH02"));
        assert_eq!(taken.portions[1].quantity, "10".parse().unwrap());
        // 90 remain from the oldest lot.
        assert_eq!(queue.quantity(), "90".parse().unwrap());
    }

    #[test]
    fn test_take_reports_uncovered_remainder() {
        let mut queue = LotQueue::new(BasisDiscipline::Fifo);
        queue.push(lot("10", "2.0", 1));

        let taken = queue.take("25".parse().unwrap()).unwrap();

        assert_eq!(taken.portions.len(), 1);
        assert_eq!(taken.uncovered, "15".parse().unwrap());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_take_rejects_non_positive() {
        let mut queue = LotQueue::new(BasisDiscipline::Fifo);
        queue.push(lot("10", "2.0", 1));

        assert!(matches!(
            queue.take(Decimal::ZERO),
            Err(LotError::ZeroOrNegative(_))
        ));
        assert!(matches!(
            queue.take("-1".parse().unwrap()),
            Err(LotError::ZeroOrNegative(_))
        ));
        // The guard fires before anything is popped.
        assert_eq!(queue.len(), 1);
    }
}
