//! Response rotation and strict request ordering.
//!
//! Rule `i` owns the slots `[start_i, start_i + responses_i)` of the global
//! sequence, where `start_i` is the number of responses declared by the rules
//! before it. With sequencing enabled a request for rule `i` is only legal
//! when the global position equals `start_i + hits_i`.

use crate::error::Violation;
use tokio::sync::Mutex;

/// Outcome of a legal hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hit {
    /// 1-based hit count of the rule after this request
    pub req_num: usize,
    /// Response to render, `None` when the rule has no responses
    pub response: Option<usize>,
}

#[derive(Debug)]
struct SequenceState {
    /// Expected next global position
    position: usize,
    /// Hits so far, per rule
    hits: Vec<usize>,
}

/// Hit counters shared by all in-flight requests.
#[derive(Debug)]
pub struct Sequencer {
    as_sequence: bool,
    /// Number of responses per rule
    lens: Vec<usize>,
    /// First sequence slot per rule
    starts: Vec<usize>,
    state: Mutex<SequenceState>,
}

impl Sequencer {
    /// Create a sequencer for rules with the given response counts.
    pub fn new(as_sequence: bool, lens: Vec<usize>) -> Self {
        let starts = lens
            .iter()
            .scan(0, |acc, len| {
                let start = *acc;
                *acc += len;
                Some(start)
            })
            .collect();
        let hits = vec![0; lens.len()];

        Self {
            as_sequence,
            lens,
            starts,
            state: Mutex::new(SequenceState { position: 0, hits }),
        }
    }

    /// Record a request matching `rule` and pick its response.
    ///
    /// The ordering check, both counter increments and the rotation choice
    /// happen under one lock. An out-of-order request leaves the counters
    /// untouched.
    pub async fn advance(&self, rule: usize) -> Result<Hit, Violation> {
        let mut state = self.state.lock().await;
        let hits = state.hits[rule];
        let slot = self.starts[rule] + hits;

        if self.as_sequence && state.position != slot {
            return Err(Violation::OutOfSequence {
                rule,
                expected: state.position,
                actual: slot,
            });
        }

        let len = self.lens[rule];
        let response = (len > 0).then(|| hits % len);

        state.hits[rule] = hits + 1;
        state.position += 1;

        Ok(Hit {
            req_num: hits + 1,
            response,
        })
    }

    /// Current global position.
    pub async fn position(&self) -> usize {
        self.state.lock().await.position
    }

    /// Hits so far for `rule`.
    pub async fn hits(&self, rule: usize) -> usize {
        self.state.lock().await.hits.get(rule).copied().unwrap_or(0)
    }

    /// First sequence slot of `rule`.
    pub fn window_start(&self, rule: usize) -> usize {
        self.starts[rule]
    }
}
