use ethers::types::U256;

use crate::common::math;

/// EIP-1559 fee pair used for bundle transactions.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct GasFees {
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

impl GasFees {
    pub fn new(max_fee_per_gas: U256, max_priority_fee_per_gas: U256) -> Self {
        Self {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        }
    }

    pub fn increase_by_percent(self, percent: u64) -> Self {
        Self {
            max_fee_per_gas: math::increase_by_percent(self.max_fee_per_gas, percent),
            max_priority_fee_per_gas: math::increase_by_percent(
                self.max_priority_fee_per_gas,
                percent,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increase_by_percent() {
        let fees = GasFees::new(100.into(), 10.into());
        let bumped = fees.increase_by_percent(20);
        assert_eq!(bumped.max_fee_per_gas, 120.into());
        assert_eq!(bumped.max_priority_fee_per_gas, 12.into());
    }
}
