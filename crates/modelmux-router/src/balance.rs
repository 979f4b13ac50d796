//! Load balancing over a request's candidate list.
//!
//! Balancing only decides which candidate goes first; the rest of the list
//! stays available for fail-over. Each strategy reorders in place:
//!
//! | strategy      | first candidate                         | rest            |
//! |---------------|-----------------------------------------|-----------------|
//! | `ordered`     | routing primary                         | routing order   |
//! | `round_robin` | next in a per-task rotation             | rotated order   |
//! | `random`      | uniformly chosen                        | routing order   |
//! | `least_used`  | fewest recorded calls (ties: routing)   | by call count   |

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use rand::Rng;

use modelmux_core::config::BalanceStrategy;

#[derive(Debug)]
pub(crate) struct Balancer {
    strategy: BalanceStrategy,
    /// Task → requests seen, for round robin.
    cursors: Mutex<HashMap<String, usize>>,
}

impl Balancer {
    pub(crate) fn new(strategy: BalanceStrategy) -> Self {
        Self {
            strategy,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn strategy(&self) -> BalanceStrategy {
        self.strategy
    }

    /// Reorder `items` for one request on `task`. `calls` reads an item's
    /// recorded call count.
    pub(crate) fn arrange<T>(&self, task: &str, items: &mut [T], calls: impl Fn(&T) -> u64) {
        if items.len() < 2 {
            return;
        }
        match self.strategy {
            BalanceStrategy::Ordered => {}
            BalanceStrategy::RoundRobin => {
                let turn = self.next_turn(task);
                items.rotate_left(turn % items.len());
            }
            BalanceStrategy::Random => {
                let pick = rand::thread_rng().gen_range(0..items.len());
                items[..=pick].rotate_right(1);
            }
            BalanceStrategy::LeastUsed => items.sort_by_key(calls),
        }
    }

    fn next_turn(&self, task: &str) -> usize {
        let mut cursors = self.cursors.lock().unwrap_or_else(PoisonError::into_inner);
        let cursor = cursors.entry(task.to_string()).or_insert(0);
        let turn = *cursor;
        *cursor = cursor.wrapping_add(1);
        turn
    }
}
