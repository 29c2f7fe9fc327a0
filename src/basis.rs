//! The cost basis ledger: a per-run state machine over per-asset lot
//! queues and periodic totals, driven by one transaction group at a time.
pub use self::lot::{Acquisition, BasisDiscipline, Lot, LotError, LotQueue};

use crate::client::DataApi;
use crate::config::Annotations;
use crate::model::amount::AssetId;
use crate::model::events::{AccountEvent, ChangeKind, TxGroup, TxHash};
use crate::report::{PeriodKind, PeriodSummary, ReportSink, SplitLine, Warning};
use chrono::{DateTime, Months, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, warn};

use self::totals::{month_key, year_key, Accumulator};

mod lot;
#[cfg(test)]
mod prop_tests;
mod totals;

#[derive(Debug, Error)]
pub enum BasisError {
    #[error("Empty transaction group")]
    EmptyGroup,

    /// Escalated from a warning under strict mode. The acquisition
    /// happened outside the observed history window.
    #[error("Inventory exhausted covering {uncovered} {asset} in {tx_hash} (strict)")]
    InventoryExhausted {
        asset: AssetId,
        uncovered: Decimal,
        tx_hash: TxHash,
    },

    /// A disposal asked the lot queue for a non-positive quantity. This
    /// is a classification bug, not a recoverable condition.
    #[error("Lot queue invariant violated for {asset} in {tx_hash}")]
    Lot {
        asset: AssetId,
        tx_hash: TxHash,
        #[source]
        source: LotError,
    },
}

/// Capital gains are classified by how long the consumed lot was held at
/// disposal, evaluated per consumed portion.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum GainTerm {
    Short,
    Long,
}

/// Terminal state of one processed transaction group.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum GroupOutcome {
    /// At least one event changed inventory or totals.
    Recorded,

    /// A same-asset payment between observed accounts. Custody moved,
    /// net position did not.
    IgnoredTransfer,

    /// Skipped by a transaction annotation.
    IgnoredByAnnotation,

    /// Nothing in the group had an effect (zero amounts, suppressed
    /// fees, ignored assets).
    IgnoredNoOp,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct LedgerOptions {
    /// Escalate inventory gaps to hard failures.
    pub strict: bool,

    /// Drop `transaction_cost` events instead of recording them in the
    /// fee bucket.
    pub suppress_fees: bool,
}

/// What a completed run produced, beyond what the sink already received.
/// Warnings are surfaced here so the final report can show them; they are
/// not merely logged.
#[derive(Debug)]
pub struct RunSummary {
    pub transactions: u64,
    pub lifetime: Option<PeriodSummary>,
    pub warnings: Vec<Warning>,
}

pub struct CostBasisLedger<'a, C, S> {
    client: &'a C,
    sink: &'a mut S,
    base: AssetId,
    discipline: BasisDiscipline,
    annotations: &'a Annotations,
    options: LedgerOptions,

    // Per-asset chronological queues of not-yet-consumed acquisitions.
    inventory: HashMap<AssetId, LotQueue>,

    monthly: Accumulator,
    yearly: Accumulator,
    lifetime: Accumulator,

    warnings: Vec<Warning>,
    transactions: u64,
}

impl<'a, C, S> CostBasisLedger<'a, C, S>
where
    C: DataApi,
    S: ReportSink,
{
    pub fn new(
        client: &'a C,
        sink: &'a mut S,
        base: AssetId,
        discipline: BasisDiscipline,
        annotations: &'a Annotations,
        options: LedgerOptions,
    ) -> Self {
        Self {
            client,
            sink,
            base,
            discipline,
            annotations,
            options,
            inventory: HashMap::new(),
            monthly: Accumulator::new(PeriodKind::Month),
            yearly: Accumulator::new(PeriodKind::Year),
            lifetime: Accumulator::new(PeriodKind::Lifetime),
            warnings: Vec::new(),
            transactions: 0,
        }
    }

    /// Consume one transaction group. Debits are considered sales and
    /// matched against earlier credits; same-asset payments between
    /// observed accounts move funds, not positions, and are skipped.
    pub fn process_group(&mut self, group: &TxGroup) -> Result<GroupOutcome, BasisError> {
        if group.is_empty() {
            return Err(BasisError::EmptyGroup);
        }
        self.transactions += 1;

        let directive = self.annotations.transaction(group.hash());
        let note = directive.and_then(|d| d.note.clone());
        let strict = directive
            .and_then(|d| d.strict)
            .unwrap_or(self.options.strict);
        if directive.is_some_and(|d| d.ignore) {
            debug!("Ignoring transaction {} (annotation)", group.hash());
            return Ok(GroupOutcome::IgnoredByAnnotation);
        }

        // Are we the sender and the receiver?
        let mut source = None;
        let mut destination = None;
        for event in group.iter() {
            match event.change.kind {
                ChangeKind::PaymentSource => source = Some(event),
                ChangeKind::PaymentDestination => destination = Some(event),
                _ => {}
            }
        }
        if let (Some(source), Some(destination)) = (source, destination) {
            if source.change.asset() == destination.change.asset() {
                debug!(
                    "Ignoring {} balance changes caused by payment from {} to {} ({})",
                    group.len(),
                    source.nick,
                    destination.nick,
                    group.hash(),
                );
                return Ok(GroupOutcome::IgnoredTransfer);
            }
            debug!(
                "Payment converted {} {} from {} into {} {} for {}",
                source.change.amount_change,
                source.change.asset(),
                source.nick,
                destination.change.amount_change,
                destination.change.asset(),
                destination.nick,
            );
        }

        let mut recorded = false;
        for event in group.iter() {
            let change = &event.change;
            let asset = change.asset();

            // Used to silence experimental issuances, or issuances with
            // no conversion to the base asset.
            if self.annotations.asset(&asset).is_some_and(|d| d.ignore) {
                debug!(
                    "Ignoring {} {} (annotated to ignore {asset})",
                    change.kind, change.amount_change,
                );
                continue;
            }

            match change.kind {
                ChangeKind::TransactionCost => {
                    if self.options.suppress_fees {
                        debug!("Suppressing fee {} ({})", change.amount_change, change.tx_hash);
                        continue;
                    }
                    self.record_fee(event, note.as_deref());
                    recorded = true;
                }
                ChangeKind::PaymentSource
                | ChangeKind::PaymentDestination
                | ChangeKind::Exchange
                | ChangeKind::Intermediary => {
                    if change.amount_change.is_zero() {
                        // Happens when an offer create does not trade.
                        debug!(
                            "Ignoring zero amount change, {} {}",
                            change.kind, change.tx_hash,
                        );
                        continue;
                    }

                    if change.amount_change.is_sign_negative() {
                        self.record_debit(event, strict, note.as_deref())?;
                    } else {
                        self.record_credit(event, note.as_deref());
                    }
                    recorded = true;
                }
            }
        }

        Ok(if recorded {
            GroupOutcome::Recorded
        } else {
            GroupOutcome::IgnoredNoOp
        })
    }

    /// Emit final open periods and hand back collected warnings.
    pub fn finish(self) -> RunSummary {
        let Self {
            sink,
            monthly,
            yearly,
            lifetime,
            warnings,
            transactions,
            ..
        } = self;

        if let Some(summary) = monthly.summary() {
            sink.period(summary);
        }
        if let Some(summary) = yearly.summary() {
            sink.period(summary);
        }
        let lifetime = lifetime.summary();
        if let Some(summary) = &lifetime {
            sink.period(summary.clone());
        }

        RunSummary {
            transactions,
            lifetime,
            warnings,
        }
    }

    /// Close out periodic totals before tallying into a new period.
    /// Totals for a period are only ever emitted once it has fully
    /// closed; the in-progress period is flushed by `finish`.
    fn rollover(&mut self, when: DateTime<Utc>) {
        if let Some(summary) = self.monthly.rollover(&month_key(when)) {
            self.sink.period(summary);
        }
        if let Some(summary) = self.yearly.rollover(&year_key(when)) {
            self.sink.period(summary);
        }
    }

    fn normalize_or_warn(
        &mut self,
        event: &AccountEvent,
    ) -> Option<crate::client::Normalized> {
        let change = &event.change;
        let asset = change.asset();

        match self.client.normalize(
            change.amount_change,
            &asset,
            &self.base,
            change.executed_time,
        ) {
            Ok(normalized) => Some(normalized),
            Err(err) => {
                warn!(
                    "Failed to normalize {} {} at {}: {err}",
                    change.amount_change, asset, change.executed_time,
                );
                self.warnings.push(Warning::NormalizationGap {
                    asset,
                    base: self.base.clone(),
                    when: change.executed_time,
                    tx_hash: change.tx_hash.clone(),
                });

                None
            }
        }
    }

    /// Asset purchased or received: store the current rate as cost basis
    /// for a later sale.
    fn record_credit(&mut self, event: &AccountEvent, note: Option<&str>) {
        let change = &event.change;
        self.rollover(change.executed_time);

        let asset = change.asset();
        let normalized = self.normalize_or_warn(event);
        let rate = normalized.map(|n| n.rate);

        // Push the lot even without a rate, so inventory stays conserved.
        // The gap resurfaces when the lot is consumed.
        self.inventory
            .entry(asset.clone())
            .or_insert_with(|| LotQueue::new(self.discipline))
            .push(Lot {
                quantity: change.amount_change,
                rate,
                acquired: Acquisition {
                    tx_hash: change.tx_hash.clone(),
                    time: change.executed_time,
                },
            });

        if let Some(normalized) = normalized {
            self.monthly.credit(normalized.converted);
            self.yearly.credit(normalized.converted);
            self.lifetime.credit(normalized.converted);
        }

        self.sink.split(SplitLine {
            time: change.executed_time,
            nick: event.nick.clone(),
            account: event.account.clone(),
            tx_hash: change.tx_hash.clone(),
            kind: change.kind,
            asset,
            amount: change.amount_change,
            rate,
            converted: normalized.map(|n| n.converted),
            basis: None,
            basis_span: None,
            gain_short: None,
            gain_long: None,
            note: note.map(str::to_string),
        });
    }

    /// Asset spent or traded: consume earlier acquisitions and realize
    /// the gain against them.
    fn record_debit(
        &mut self,
        event: &AccountEvent,
        strict: bool,
        note: Option<&str>,
    ) -> Result<(), BasisError> {
        let change = &event.change;
        self.rollover(change.executed_time);

        let asset = change.asset();
        let quantity = change.amount_change.abs();

        let taken = self
            .inventory
            .entry(asset.clone())
            .or_insert_with(|| LotQueue::new(self.discipline))
            .take(quantity)
            .map_err(|source| BasisError::Lot {
                asset: asset.clone(),
                tx_hash: change.tx_hash.clone(),
                source,
            })?;

        if !taken.uncovered.is_zero() {
            if strict {
                return Err(BasisError::InventoryExhausted {
                    asset,
                    uncovered: taken.uncovered,
                    tx_hash: change.tx_hash.clone(),
                });
            }
            warn!(
                "Did not find historic basis for {} of {} {asset} ({})",
                taken.uncovered, quantity, change.tx_hash,
            );
            self.warnings.push(Warning::InventoryGap {
                asset: asset.clone(),
                uncovered: taken.uncovered,
                tx_hash: change.tx_hash.clone(),
            });
        }

        let normalized = self.normalize_or_warn(event);

        // The term test is per consumed portion: one disposal can span
        // lots on both sides of the one year threshold.
        let long_term_before = change.executed_time - Months::new(12);

        let mut basis_total = Decimal::ZERO;
        let mut has_basis = false;
        let mut gain_short = Decimal::ZERO;
        let mut gain_long = Decimal::ZERO;
        let mut has_short = false;
        let mut has_long = false;
        let mut basis_span: Option<(DateTime<Utc>, DateTime<Utc>)> = None;

        for portion in &taken.portions {
            let acquired = portion.acquired.time;
            basis_span = Some(match basis_span {
                Some((from, to)) => (from.min(acquired), to.max(acquired)),
                None => (acquired, acquired),
            });

            match portion.rate {
                Some(rate) => {
                    let basis = portion.quantity * rate;
                    basis_total += basis;
                    has_basis = true;

                    if let Some(normalized) = normalized {
                        let value = portion.quantity * normalized.rate;
                        let gain = value - basis;
                        if acquired < long_term_before {
                            gain_long += gain;
                            has_long = true;
                        } else {
                            gain_short += gain;
                            has_short = true;
                        }
                    }
                }
                None => {
                    // The acquisition's rate lookup failed back when the
                    // lot was pushed; the basis gap lands on this line.
                    self.warnings.push(Warning::BasisGap {
                        asset: asset.clone(),
                        quantity: portion.quantity,
                        tx_hash: change.tx_hash.clone(),
                        acquired: portion.acquired.tx_hash.clone(),
                    });
                }
            }
        }

        if let Some(normalized) = normalized {
            self.monthly.debit(normalized.converted);
            self.yearly.debit(normalized.converted);
            self.lifetime.debit(normalized.converted);

            if has_short {
                self.monthly.gain(GainTerm::Short, gain_short);
                self.yearly.gain(GainTerm::Short, gain_short);
                self.lifetime.gain(GainTerm::Short, gain_short);
            }
            if has_long {
                self.monthly.gain(GainTerm::Long, gain_long);
                self.yearly.gain(GainTerm::Long, gain_long);
                self.lifetime.gain(GainTerm::Long, gain_long);
            }
        }

        self.sink.split(SplitLine {
            time: change.executed_time,
            nick: event.nick.clone(),
            account: event.account.clone(),
            tx_hash: change.tx_hash.clone(),
            kind: change.kind,
            asset,
            amount: change.amount_change,
            rate: normalized.map(|n| n.rate),
            converted: normalized.map(|n| n.converted),
            basis: has_basis.then_some(basis_total),
            basis_span,
            gain_short: (normalized.is_some() && has_short).then_some(gain_short),
            gain_long: (normalized.is_some() && has_long).then_some(gain_long),
            note: note.map(str::to_string),
        });

        Ok(())
    }

    /// Transaction fees never pass through the lot queues; they land in a
    /// separate fee bucket of the periodic totals.
    fn record_fee(&mut self, event: &AccountEvent, note: Option<&str>) {
        let change = &event.change;
        self.rollover(change.executed_time);

        let asset = change.asset();
        let normalized = self.normalize_or_warn(event);

        if let Some(normalized) = normalized {
            self.monthly.fee(normalized.converted);
            self.yearly.fee(normalized.converted);
            self.lifetime.fee(normalized.converted);
        }

        self.sink.split(SplitLine {
            time: change.executed_time,
            nick: event.nick.clone(),
            account: event.account.clone(),
            tx_hash: change.tx_hash.clone(),
            kind: change.kind,
            asset,
            amount: change.amount_change,
            rate: normalized.map(|n| n.rate),
            converted: normalized.map(|n| n.converted),
            basis: None,
            basis_span: None,
            gain_short: None,
            gain_long: None,
            note: note.map(str::to_string),
        });
    }
}

#[cfg(test)]
impl<C, S> CostBasisLedger<'_, C, S> {
    /// Remaining inventory for one asset, for conservation assertions.
    pub(crate) fn remaining(&self, asset: &AssetId) -> Decimal {
        self.inventory
            .get(asset)
            .map(LotQueue::quantity)
            .unwrap_or_default()
    }
}
