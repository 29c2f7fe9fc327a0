//! Iterates through the activity of multiple ledger accounts in
//! chronological order.
//!
//! The Data API pages through a single account's history at a time. To
//! observe several accounts as one timeline, a pending queue keeps the
//! oldest not-yet-consumed event of every account, ordered by ledger
//! index and intra-ledger transaction index. Every pop is immediately
//! followed by queueing that account's next event, so no account's turn
//! can be skipped.
use crate::client::{AccountData, DataApi, DataApiError};
use crate::model::amount::Address;
use crate::model::events::{AccountEvent, BalanceChange, TxGroup};
use rayon::prelude::*;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::rc::Rc;
use std::sync::mpsc::Receiver;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("Failed to get account data for {nick}")]
    AccountData {
        nick: String,
        #[source]
        source: DataApiError,
    },

    #[error("Balance change stream for {nick} failed")]
    Stream {
        nick: String,
        #[source]
        source: DataApiError,
    },
}

/// Chronological ordering key. `seq` is the order of arrival into the
/// queue; it breaks ties between events whose source did not report a
/// transaction index, preserving each stream's own order.
#[derive(Copy, Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
struct ChronoKey {
    ledger_index: u32,
    tx_index: u32,
    seq: u64,
}

#[derive(Debug)]
struct PendingEvent {
    key: ChronoKey,
    event: AccountEvent,
}

impl PartialEq for PendingEvent {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for PendingEvent {}

impl PartialOrd for PendingEvent {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingEvent {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}

/// Per-account stream state. One cursor exists per observed account; it
/// is removed when its upstream stream is exhausted.
struct Cursor {
    nick: Rc<str>,
    account: Address,
    rx: Receiver<Result<BalanceChange, DataApiError>>,
}

pub struct BalanceChangeIterator<'a, C> {
    client: &'a C,
    accounts: BTreeMap<String, Address>,

    /// Account creation metadata, keyed by nickname. Populated by `init`.
    pub account_data: BTreeMap<String, AccountData>,

    cursors: HashMap<Rc<str>, Cursor>,

    // Not yet consumed events, ordered chronologically.
    pending: BinaryHeap<Reverse<PendingEvent>>,
    seq: u64,
}

impl<'a, C: DataApi> BalanceChangeIterator<'a, C> {
    pub fn new(client: &'a C, accounts: BTreeMap<String, Address>) -> Self {
        let capacity = accounts.len();

        Self {
            client,
            accounts,
            account_data: BTreeMap::new(),
            cursors: HashMap::with_capacity(capacity),
            pending: BinaryHeap::with_capacity(capacity * 2),
            seq: 0,
        }
    }

    /// Query account metadata and open every account's stream. Metadata
    /// queries run concurrently; any failure aborts initialization. Time
    /// consuming, since it waits on the upstream API.
    pub fn init(&mut self) -> Result<(), HistoryError> {
        self.account_data = self
            .accounts
            .par_iter()
            .map(|(nick, account)| {
                let data =
                    self.client
                        .account_data(account)
                        .map_err(|source| HistoryError::AccountData {
                            nick: nick.clone(),
                            source,
                        })?;

                Ok((nick.clone(), data))
            })
            .collect::<Result<_, HistoryError>>()?;

        // Open a stream per account and seed the pending queue with each
        // account's first event.
        let accounts: Vec<(Rc<str>, Address)> = self
            .accounts
            .iter()
            .map(|(nick, account)| (Rc::from(nick.as_str()), account.clone()))
            .collect();
        for (nick, account) in accounts {
            let rx = self.client.balance_change_stream(&account);
            self.cursors.insert(
                nick.clone(),
                Cursor {
                    nick: nick.clone(),
                    account,
                    rx,
                },
            );
            self.queue_balance_change(&nick)?;
        }

        Ok(())
    }

    /// Dequeue the next event for `nick` into the pending queue. Removes
    /// the cursor when the stream is exhausted; a stream error is
    /// surfaced, never mistaken for exhaustion.
    fn queue_balance_change(&mut self, nick: &str) -> Result<(), HistoryError> {
        let dequeued = {
            let Some(cursor) = self.cursors.get(nick) else {
                return Ok(());
            };

            // The only suspension point: waiting on this account's
            // producer to deliver its next page.
            match cursor.rx.recv() {
                Ok(Ok(change)) => Some(AccountEvent {
                    nick: cursor.nick.clone(),
                    account: cursor.account.clone(),
                    change,
                }),
                Ok(Err(source)) => {
                    return Err(HistoryError::Stream {
                        nick: nick.to_string(),
                        source,
                    });
                }
                Err(_) => None,
            }
        };

        match dequeued {
            Some(event) => {
                self.seq += 1;
                let key = ChronoKey {
                    ledger_index: event.change.ledger_index,
                    tx_index: event.change.tx_index,
                    seq: self.seq,
                };
                self.pending.push(Reverse(PendingEvent { key, event }));
            }
            None => {
                debug!("Balance change stream for {nick} exhausted");
                self.cursors.remove(nick);
            }
        }

        Ok(())
    }

    /// Return all events generated by the next pending transaction, or
    /// `None` when every account's history is exhausted.
    ///
    /// The upstream API does not say how many events a transaction
    /// produced; group membership is discovered by consuming the queue
    /// head until its hash changes. The first event with a different hash
    /// stays queued as the next group's start.
    pub fn next_group(&mut self) -> Result<Option<TxGroup>, HistoryError> {
        let Some(Reverse(first)) = self.pending.pop() else {
            return Ok(None);
        };
        // Every consumed event is replaced by that account's next one.
        let nick = first.event.nick.clone();
        self.queue_balance_change(&nick)?;

        let hash = first.event.change.tx_hash.clone();
        let mut events = vec![first.event];

        loop {
            match self.pending.peek() {
                Some(Reverse(head)) if head.event.change.tx_hash == hash => {}
                _ => break,
            }
            let Some(Reverse(next)) = self.pending.pop() else {
                break;
            };
            let nick = next.event.nick.clone();
            self.queue_balance_change(&nick)?;
            events.push(next.event);
        }

        Ok(Some(TxGroup { events }))
    }
}
