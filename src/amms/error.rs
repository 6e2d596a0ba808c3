use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AMMError {
    #[error("{function} did not converge after {rounds} rounds")]
    DidNotConverge {
        function: &'static str,
        rounds: usize,
    },
    #[error("Invalid coin indices {i} and {j} for a pool of {n_coins} coins")]
    InvalidCoinIndex { i: usize, j: usize, n_coins: usize },
    #[error("Expected {expected} balances, got {actual}")]
    BalancesLengthMismatch { expected: usize, actual: usize },
    #[error("Meta pool state without its base pool state")]
    MissingBasePoolState,
    #[error("Fee {fee} is not below one million")]
    InvalidFee { fee: u32 },
    #[error("Incompatible token")]
    IncompatibleToken,
    #[error("Insufficient liquidity")]
    InsufficientLiquidity,
    #[error("Liquidity Underflow")]
    LiquidityUnderflow,
    #[error("Arithmetic overflow")]
    Overflow,
    #[error("Division by zero")]
    DivisionByZero,
}
