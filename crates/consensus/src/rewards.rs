//! Block subsidy schedule.

use crate::money::{Amount, COIN};
use crate::params::ChainParams;

pub fn block_subsidy(height: i32, params: &ChainParams) -> Amount {
    let halvings = height / params.subsidy_halving_interval;
    if halvings >= 64 {
        return 0;
    }
    (50 * COIN) >> halvings
}

#[cfg(test)]
mod tests {
    use super::block_subsidy;
    use crate::money::COIN;
    use crate::params::{chain_params, Network};

    #[test]
    fn subsidy_halves_on_interval() {
        let params = chain_params(Network::Mainnet);
        assert_eq!(block_subsidy(0, &params), 50 * COIN);
        assert_eq!(block_subsidy(209_999, &params), 50 * COIN);
        assert_eq!(block_subsidy(210_000, &params), 25 * COIN);
        assert_eq!(block_subsidy(420_000, &params), 1_250_000_000);
    }

    #[test]
    fn subsidy_reaches_zero() {
        let params = chain_params(Network::Mainnet);
        assert_eq!(block_subsidy(64 * 210_000, &params), 0);
    }
}
