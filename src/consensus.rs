use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::types::{format_hex, Block};

/// Block reward expressed in US dollars; the native amount depends on the
/// oracle price.
pub const FIXED_USD_REWARD: u64 = 1_000;

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("USD price must be positive")]
    ZeroPrice,
    #[error("No address has burned any funds")]
    NoBurn,
    #[error("Requested {requested} proof-of-burn wallets but only {available} addresses have burned")]
    NotEnoughBurners { requested: usize, available: usize },
}

/// Native block reward for the given USD price (integer division).
pub fn reward(usd_price: u64) -> Result<u64, ConsensusError> {
    if usd_price == 0 {
        return Err(ConsensusError::ZeroPrice);
    }
    Ok(FIXED_USD_REWARD / usd_price)
}

/// Where a transfer to the burn address is accounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BurnPolicy {
    /// Add the amount to the sender's own `burn` total; no balance is credited.
    #[default]
    CreditSender,
    /// Treat the burn address as an ordinary recipient.
    CreditBurnAddress,
}

/// Admission check for the proof-of-work attached to a gossiped block.
pub trait ProofOfWork: Send + Sync {
    fn verify(&self, nonce: Option<u64>, block: &Block) -> bool;
}

/// Accepts every block. Difficulty rules have not been decided yet, so this
/// is the hook where a real verifier plugs in.
#[derive(Debug, Default, Clone)]
pub struct UncheckedWork;

impl ProofOfWork for UncheckedWork {
    fn verify(&self, nonce: Option<u64>, block: &Block) -> bool {
        debug!(
            index = block.index,
            hash = %format_hex(&block.hash),
            ?nonce,
            "proof-of-work not checked"
        );
        true
    }
}

/// Pick `n` distinct addresses, each draw weighted by burn total, without
/// replacement.
///
/// Fails when nothing has been burned, and when fewer than `n` addresses
/// have burned anything.
pub fn select_pob_wallets<R: Rng + ?Sized>(
    burns: &[(String, u64)],
    n: usize,
    rng: &mut R,
) -> Result<Vec<String>, ConsensusError> {
    let mut candidates: Vec<(&str, u128)> = burns
        .iter()
        .filter(|(_, burn)| *burn > 0)
        .map(|(address, burn)| (address.as_str(), u128::from(*burn)))
        .collect();
    let mut total: u128 = candidates.iter().map(|(_, w)| w).sum();
    if total == 0 {
        return Err(ConsensusError::NoBurn);
    }

    let mut selected = Vec::with_capacity(n);
    for _ in 0..n {
        if candidates.is_empty() {
            return Err(ConsensusError::NotEnoughBurners {
                requested: n,
                available: selected.len(),
            });
        }
        let target = rng.gen_range(0..total);
        let mut cumulative = 0u128;
        let mut chosen = candidates.len() - 1;
        for (i, (_, weight)) in candidates.iter().enumerate() {
            cumulative += weight;
            if target < cumulative {
                chosen = i;
                break;
            }
        }
        let (address, weight) = candidates.swap_remove(chosen);
        total -= weight;
        selected.push(address.to_string());
    }
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    #[test]
    fn reward_is_pegged_to_price() {
        assert_eq!(reward(1).unwrap(), FIXED_USD_REWARD);
        assert_eq!(reward(3).unwrap(), FIXED_USD_REWARD / 3);
        assert!(matches!(reward(0), Err(ConsensusError::ZeroPrice)));
    }

    #[test]
    fn pob_selection_is_distinct_and_only_from_burners() {
        let burns = vec![
            ("Dexma".to_string(), 10),
            ("Dexmb".to_string(), 0),
            ("Dexmc".to_string(), 1_000),
            ("Dexmd".to_string(), 1),
        ];
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let picked = select_pob_wallets(&burns, 3, &mut rng).unwrap();
            let unique: HashSet<_> = picked.iter().collect();
            assert_eq!(unique.len(), 3);
            assert!(!picked.contains(&"Dexmb".to_string()));
        }
    }

    #[test]
    fn pob_selection_favours_heavy_burners() {
        let burns = vec![("Dexmheavy".to_string(), 9_999), ("Dexmlight".to_string(), 1)];
        let mut rng = StdRng::seed_from_u64(11);
        let heavy_first = (0..200)
            .filter(|_| select_pob_wallets(&burns, 1, &mut rng).unwrap()[0] == "Dexmheavy")
            .count();
        assert!(heavy_first > 190);
    }

    #[test]
    fn pob_selection_requires_burn() {
        let mut rng = StdRng::seed_from_u64(1);
        let burns = vec![("Dexma".to_string(), 0)];
        assert!(matches!(
            select_pob_wallets(&burns, 1, &mut rng),
            Err(ConsensusError::NoBurn)
        ));

        let burns = vec![("Dexma".to_string(), 5)];
        assert!(matches!(
            select_pob_wallets(&burns, 2, &mut rng),
            Err(ConsensusError::NotEnoughBurners {
                requested: 2,
                available: 1
            })
        ));
    }
}
