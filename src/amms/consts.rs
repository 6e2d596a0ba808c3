use alloy::primitives::U256;

// commonly used U256s
pub const U256_1: U256 = U256::from_limbs([1, 0, 0, 0]);
pub const U256_2: U256 = U256::from_limbs([2, 0, 0, 0]);
pub const U256_10: U256 = U256::from_limbs([10, 0, 0, 0]);
pub const U256_10000: U256 = U256::from_limbs([10000, 0, 0, 0]);

pub const U256_FEE_ONE: U256 = U256::from_limbs([1_000_000, 0, 0, 0]);
pub const U32_FEE_ONE: u32 = 1_000_000;

// StableSwap specific
pub const PRECISION: U256 = U256::from_limbs([1_000_000_000_000_000_000, 0, 0, 0]);
pub const FEE_DENOMINATOR: U256 = U256::from_limbs([10_000_000_000, 0, 0, 0]);
pub const A_PRECISION: U256 = U256::from_limbs([100, 0, 0, 0]);
pub const MAX_ITERATIONS: usize = 255;
