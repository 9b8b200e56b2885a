use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use loyalty_accrual::{AccrualOracle, OracleError};
use loyalty_schemas::{OrderStatus, Points, Verdict};

pub fn registered() -> Verdict {
    Verdict {
        status: OrderStatus::Registered,
        accrual: None,
    }
}

pub fn processing() -> Verdict {
    Verdict {
        status: OrderStatus::Processing,
        accrual: None,
    }
}

pub fn processed(points: i64) -> Verdict {
    Verdict {
        status: OrderStatus::Processed,
        accrual: Some(Points::whole(points)),
    }
}

pub fn invalid() -> Verdict {
    Verdict {
        status: OrderStatus::Invalid,
        accrual: None,
    }
}

#[derive(Default)]
struct Inner {
    scripts: HashMap<String, VecDeque<Result<Verdict, OracleError>>>,
    calls: HashMap<String, usize>,
    in_flight: HashMap<String, usize>,
    max_in_flight: HashMap<String, usize>,
}

/// Deterministic oracle for tests.
///
/// Each order number has a queue of responses. Responses are popped per
/// call; the last one repeats forever. Unscripted orders answer
/// [`OracleError::NotRegistered`]. An optional latency is applied inside the
/// call so overlapping polls of one order are observable via
/// [`ScriptedOracle::max_in_flight`].
#[derive(Default)]
pub struct ScriptedOracle {
    inner: Mutex<Inner>,
    latency: Option<Duration>,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            inner: Mutex::default(),
            latency: Some(latency),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the response queue for `order_number`.
    pub fn script(
        &self,
        order_number: &str,
        steps: impl IntoIterator<Item = Result<Verdict, OracleError>>,
    ) {
        self.lock()
            .scripts
            .insert(order_number.to_string(), steps.into_iter().collect());
    }

    /// Script a sequence of verdicts with no failures in between.
    pub fn script_verdicts(&self, order_number: &str, verdicts: impl IntoIterator<Item = Verdict>) {
        self.script(order_number, verdicts.into_iter().map(Ok));
    }

    pub fn calls(&self, order_number: &str) -> usize {
        self.lock().calls.get(order_number).copied().unwrap_or(0)
    }

    /// Highest number of simultaneous requests seen for `order_number`.
    pub fn max_in_flight(&self, order_number: &str) -> usize {
        self.lock()
            .max_in_flight
            .get(order_number)
            .copied()
            .unwrap_or(0)
    }

    fn next_response(&self, order_number: &str) -> Result<Verdict, OracleError> {
        let mut g = self.lock();
        *g.calls.entry(order_number.to_string()).or_default() += 1;
        match g.scripts.get_mut(order_number) {
            Some(q) if q.len() > 1 => q.pop_front().unwrap_or(Err(OracleError::NotRegistered)),
            Some(q) => q.front().cloned().unwrap_or(Err(OracleError::NotRegistered)),
            None => Err(OracleError::NotRegistered),
        }
    }
}

#[async_trait::async_trait]
impl AccrualOracle for ScriptedOracle {
    async fn fetch_verdict(&self, order_number: &str) -> Result<Verdict, OracleError> {
        {
            let mut g = self.lock();
            let n = {
                let n = g.in_flight.entry(order_number.to_string()).or_default();
                *n += 1;
                *n
            };
            let max = g.max_in_flight.entry(order_number.to_string()).or_default();
            *max = (*max).max(n);
        }

        if let Some(d) = self.latency {
            tokio::time::sleep(d).await;
        }
        let res = self.next_response(order_number);

        if let Some(n) = self.lock().in_flight.get_mut(order_number) {
            *n = n.saturating_sub(1);
        }
        res
    }
}
