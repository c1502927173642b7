//! Server-granted credit accounting and flow control

use crate::error::{Error, Result};
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Tracks the connection's credit balance and the margin of extra credits
/// requested on each outgoing header to grow the balance toward the
/// configured maximum.
///
/// Callers that find the balance empty park in a FIFO queue and are woken
/// one at a time as replies return credits.
pub struct CreditAccount {
    state: Mutex<AccountState>,
}

struct AccountState {
    balance: u16,
    max_credit_balance: u16,
    waiters: VecDeque<oneshot::Sender<()>>,
}

impl AccountState {
    fn opening(&self) -> u16 {
        self.max_credit_balance.saturating_sub(self.balance)
    }
}

impl CreditAccount {
    /// Open an account with one initial credit, as granted by the protocol
    /// for the first exchange. The opening margin asks the server to grow
    /// the balance toward `max_credit_balance`.
    pub fn new(max_credit_balance: u16) -> Self {
        Self {
            state: Mutex::new(AccountState {
                balance: 1,
                max_credit_balance,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Borrow up to `requested` credits, blocking while the balance is
    /// empty. Returns the granted amount (at least 1, at most `requested`)
    /// and whether the full request was satisfied.
    ///
    /// Cancellation returns without consuming credits.
    pub async fn loan(&self, requested: u16, ctx: &CancellationToken) -> Result<(u16, bool)> {
        let requested = requested.max(1);
        loop {
            let waiter = {
                let mut state = self.lock();
                if state.balance > 0 && state.waiters.is_empty() {
                    let granted = requested.min(state.balance);
                    state.balance -= granted;
                    return Ok((granted, granted == requested));
                }
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                rx
            };

            tokio::select! {
                _ = ctx.cancelled() => return Err(Error::Canceled),
                _ = waiter => {
                    // balance drained again before this waiter ran; go
                    // back to the head of the queue
                    let rx = {
                        let mut state = self.lock();
                        if state.balance > 0 {
                            let granted = requested.min(state.balance);
                            state.balance -= granted;
                            // pass any remainder on to the next in line
                            if state.balance > 0 {
                                if let Some(next) = state.waiters.pop_front() {
                                    let _ = next.send(());
                                }
                            }
                            return Ok((granted, granted == requested));
                        }
                        let (tx, rx) = oneshot::channel();
                        state.waiters.push_front(tx);
                        rx
                    };
                    tokio::select! {
                        _ = ctx.cancelled() => return Err(Error::Canceled),
                        _ = rx => continue,
                    }
                }
            }
        }
    }

    /// Account a reply's `CreditResponse` of `granted` credits against a
    /// request whose header asked for `requested`, then wake the next
    /// waiter. The opening margin shrinks automatically as the balance
    /// approaches its maximum.
    pub fn charge(&self, granted: u16, requested: u16) {
        let mut state = self.lock();
        state.balance = state.balance.saturating_add(granted);
        trace!(
            granted,
            requested,
            balance = state.balance,
            opening = state.opening(),
            "credit response accounted"
        );

        while state.balance > 0 {
            match state.waiters.pop_front() {
                Some(waiter) => {
                    if waiter.send(()).is_ok() {
                        break;
                    }
                    // waiter canceled; wake the next one
                }
                None => break,
            }
        }
    }

    /// Current credit-request margin to piggyback on outgoing headers
    pub fn opening(&self) -> u16 {
        self.lock().opening()
    }

    /// Current spendable balance
    pub fn balance(&self) -> u16 {
        self.lock().balance
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AccountState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
