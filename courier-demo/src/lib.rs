//! Shared pieces of the `publish` and `listen` binaries.
use serde::{Deserialize, Serialize};

pub mod init;

/// The payload both binaries agree on.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct Order {
    pub number: u64,
    pub item: String,
}

impl Order {
    pub fn sample(number: u64) -> Self {
        const ITEMS: [&str; 4] = ["anvil", "rope", "lantern", "compass"];
        Self {
            number,
            item: ITEMS[(number as usize) % ITEMS.len()].to_string(),
        }
    }
}
