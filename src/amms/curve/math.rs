use std::fmt::Debug;

use alloy::primitives::U256;
use serde::{Deserialize, Serialize};

use crate::amms::{
    consts::{A_PRECISION, FEE_DENOMINATOR, MAX_ITERATIONS, PRECISION, U256_1, U256_10, U256_2},
    error::AMMError,
};

/// StableSwap contract family a pool was deployed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImplementationName {
    /// Factory plain and meta pools, amplification stored with `A_PRECISION`.
    FactoryPlain,
    /// Early hand deployed pools (e.g. 3pool), amplification without extra precision.
    Legacy,
}

impl ImplementationName {
    pub fn math(self) -> &'static dyn StableSwapMath {
        match self {
            Self::FactoryPlain => &PreciseMath,
            Self::Legacy => &LegacyMath,
        }
    }

    /// Whether the pool exposes `A_precise()`.
    pub const fn has_a_precise(self) -> bool {
        matches!(self, Self::FactoryPlain)
    }
}

pub(super) fn mul(a: U256, b: U256) -> Result<U256, AMMError> {
    a.checked_mul(b).ok_or(AMMError::Overflow)
}

pub(super) fn div(a: U256, b: U256) -> Result<U256, AMMError> {
    a.checked_div(b).ok_or(AMMError::DivisionByZero)
}

pub(super) fn add(a: U256, b: U256) -> Result<U256, AMMError> {
    a.checked_add(b).ok_or(AMMError::Overflow)
}

pub(super) fn sub(a: U256, b: U256) -> Result<U256, AMMError> {
    a.checked_sub(b).ok_or(AMMError::InsufficientLiquidity)
}

fn converged(current: U256, previous: U256) -> bool {
    current.abs_diff(previous) <= U256_1
}

/// Pure StableSwap functions of one implementation family.
///
/// Amounts in `xp` are normalized to 18 decimals. `amp` is the amplification as stored by the
/// pool, i.e. including `A_PRECISION` for the families that use it.
pub trait StableSwapMath: Debug + Send + Sync {
    /// Rate of each coin, `10^(36 - decimals)`.
    fn compute_scaling_factors(&self, decimals: &[u8]) -> Vec<U256> {
        decimals
            .iter()
            .map(|decimals| U256_10.pow(U256::from(36 - u64::from((*decimals).min(36)))))
            .collect()
    }

    fn compute_xp(&self, rates: &[U256], balances: &[U256]) -> Result<Vec<U256>, AMMError> {
        if rates.len() != balances.len() {
            return Err(AMMError::BalancesLengthMismatch {
                expected: rates.len(),
                actual: balances.len(),
            });
        }

        rates
            .iter()
            .zip(balances)
            .map(|(rate, balance)| div(mul(*rate, *balance)?, PRECISION))
            .collect()
    }

    /// Invariant `D` of the pool.
    fn compute_invariant(&self, xp: &[U256], amp: U256) -> Result<U256, AMMError>;

    /// Balance of coin `i` that gives invariant `d`, the other balances taken from `xp`.
    fn compute_y_d(&self, i: usize, xp: &[U256], amp: U256, d: U256) -> Result<U256, AMMError>;

    /// Balance of coin `j` that keeps the invariant when coin `i` has balance `x`.
    fn compute_y(
        &self,
        i: usize,
        j: usize,
        x: U256,
        xp: &[U256],
        amp: U256,
    ) -> Result<U256, AMMError> {
        check_indices(i, j, xp.len())?;
        let d = self.compute_invariant(xp, amp)?;
        let mut xp = xp.to_vec();
        xp[i] = x;
        self.compute_y_d(j, &xp, amp, d)
    }

    /// `get_dy`: amount of coin `j` received for `dx` of coin `i`, net of fees.
    fn compute_output_amount(
        &self,
        amp: U256,
        fee: U256,
        rates: &[U256],
        balances: &[U256],
        i: usize,
        j: usize,
        dx: U256,
    ) -> Result<U256, AMMError> {
        let xp = self.compute_xp(rates, balances)?;
        check_indices(i, j, xp.len())?;

        let x = add(xp[i], div(mul(dx, rates[i])?, PRECISION)?)?;
        let y = self.compute_y(i, j, x, &xp, amp)?;
        let dy = sub(sub(xp[j], y)?, U256_1)?;
        let dy_fee = div(mul(dy, fee)?, FEE_DENOMINATOR)?;

        div(mul(sub(dy, dy_fee)?, PRECISION)?, rates[j])
    }

    /// `calc_token_amount`: LP tokens minted for depositing `amounts`, or burned for withdrawing
    /// them. Fees are not included.
    fn compute_token_amount(
        &self,
        amp: U256,
        rates: &[U256],
        balances: &[U256],
        total_supply: U256,
        amounts: &[U256],
        is_deposit: bool,
    ) -> Result<U256, AMMError> {
        if amounts.len() != balances.len() {
            return Err(AMMError::BalancesLengthMismatch {
                expected: balances.len(),
                actual: amounts.len(),
            });
        }

        let d0 = self.compute_invariant(&self.compute_xp(rates, balances)?, amp)?;
        let balances = balances
            .iter()
            .zip(amounts)
            .map(|(balance, amount)| {
                if is_deposit {
                    add(*balance, *amount)
                } else {
                    sub(*balance, *amount)
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        let d1 = self.compute_invariant(&self.compute_xp(rates, &balances)?, amp)?;

        let diff = if is_deposit {
            sub(d1, d0)?
        } else {
            sub(d0, d1)?
        };
        div(mul(diff, total_supply)?, d0)
    }

    /// `calc_withdraw_one_coin`: amount of coin `i` received for burning `token_amount` LP
    /// tokens, net of the imbalance fee.
    fn compute_withdraw_one_coin(
        &self,
        amp: U256,
        fee: U256,
        rates: &[U256],
        balances: &[U256],
        total_supply: U256,
        token_amount: U256,
        i: usize,
    ) -> Result<U256, AMMError> {
        let n_coins = U256::from(balances.len());
        // fee * N / (4 * (N - 1))
        let fee = div(mul(fee, n_coins)?, mul(U256::from(4), sub(n_coins, U256_1)?)?)?;

        let xp = self.compute_xp(rates, balances)?;
        let d0 = self.compute_invariant(&xp, amp)?;
        let d1 = sub(d0, div(mul(token_amount, d0)?, total_supply)?)?;
        let new_y = self.compute_y_d(i, &xp, amp, d1)?;

        let mut xp_reduced = xp.clone();
        for (k, reduced) in xp_reduced.iter_mut().enumerate() {
            let scaled = div(mul(xp[k], d1)?, d0)?;
            let dx_expected = if k == i {
                sub(scaled, new_y)?
            } else {
                sub(xp[k], scaled)?
            };
            *reduced = sub(*reduced, div(mul(fee, dx_expected)?, FEE_DENOMINATOR)?)?;
        }

        let dy = sub(xp_reduced[i], self.compute_y_d(i, &xp_reduced, amp, d1)?)?;
        // One wei less to cover rounding
        div(mul(sub(dy, U256_1)?, PRECISION)?, rates[i])
    }
}

fn check_indices(i: usize, j: usize, n_coins: usize) -> Result<(), AMMError> {
    if i == j || i >= n_coins || j >= n_coins {
        return Err(AMMError::InvalidCoinIndex { i, j, n_coins });
    }
    Ok(())
}

/// Newton iteration on `D` shared by both families, `step` computes the next iterate from
/// `(Ann, S, D, D_P)`. Returns the last iterate and whether it converged.
fn newton_d(
    xp: &[U256],
    amp: U256,
    step: impl Fn(U256, U256, U256, U256) -> Result<U256, AMMError>,
) -> Result<(U256, bool), AMMError> {
    let n_coins = U256::from(xp.len());
    let s = xp.iter().try_fold(U256::ZERO, |s, x| add(s, *x))?;
    if s.is_zero() {
        return Ok((U256::ZERO, true));
    }

    let ann = mul(amp, n_coins)?;
    let mut d = s;
    for _ in 0..MAX_ITERATIONS {
        let mut d_p = d;
        for x in xp {
            d_p = div(mul(d_p, d)?, mul(*x, n_coins)?)?;
        }
        let previous = d;
        d = step(ann, s, d, d_p)?;
        if converged(d, previous) {
            return Ok((d, true));
        }
    }

    Ok((d, false))
}

/// `c` and `S` of the quadratic solved for coin `i`, before amplification scaling.
fn y_terms(i: usize, xp: &[U256], d: U256) -> Result<(U256, U256), AMMError> {
    if i >= xp.len() {
        return Err(AMMError::InvalidCoinIndex {
            i,
            j: i,
            n_coins: xp.len(),
        });
    }

    let n_coins = U256::from(xp.len());
    let mut c = d;
    let mut s = U256::ZERO;
    for (_, x_k) in xp.iter().enumerate().filter(|(k, _)| *k != i) {
        s = add(s, *x_k)?;
        c = div(mul(c, d)?, mul(*x_k, n_coins)?)?;
    }

    Ok((c, s))
}

fn newton_y(c: U256, b: U256, d: U256) -> Result<(U256, bool), AMMError> {
    let mut y = d;
    for _ in 0..MAX_ITERATIONS {
        let previous = y;
        let numerator = add(mul(y, y)?, c)?;
        let denominator = sub(add(mul(U256_2, y)?, b)?, d)?;
        y = div(numerator, denominator)?;
        if converged(y, previous) {
            return Ok((y, true));
        }
    }
    Ok((y, false))
}

fn did_not_converge(function: &'static str) -> AMMError {
    AMMError::DidNotConverge {
        function,
        rounds: MAX_ITERATIONS,
    }
}

/// Factory pools: `A_PRECISION` scaled amplification, non-convergence is an error.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreciseMath;

impl StableSwapMath for PreciseMath {
    fn compute_invariant(&self, xp: &[U256], amp: U256) -> Result<U256, AMMError> {
        let n_coins = U256::from(xp.len());
        let (d, settled) = newton_d(xp, amp, |ann, s, d, d_p| {
            let numerator = mul(add(div(mul(ann, s)?, A_PRECISION)?, mul(d_p, n_coins)?)?, d)?;
            let denominator = add(
                div(mul(sub(ann, A_PRECISION)?, d)?, A_PRECISION)?,
                mul(add(n_coins, U256_1)?, d_p)?,
            )?;
            div(numerator, denominator)
        })?;

        if !settled {
            return Err(did_not_converge("get_D"));
        }
        Ok(d)
    }

    fn compute_y_d(&self, i: usize, xp: &[U256], amp: U256, d: U256) -> Result<U256, AMMError> {
        let n_coins = U256::from(xp.len());
        let ann = mul(amp, n_coins)?;
        let (c, s) = y_terms(i, xp, d)?;
        let c = div(mul(mul(c, d)?, A_PRECISION)?, mul(ann, n_coins)?)?;
        let b = add(s, div(mul(d, A_PRECISION)?, ann)?)?;

        let (y, settled) = newton_y(c, b, d)?;
        if !settled {
            return Err(did_not_converge("get_y"));
        }
        Ok(y)
    }
}

/// Legacy pools: plain amplification, the last iterate is used when the solver does not settle.
#[derive(Debug, Clone, Copy, Default)]
pub struct LegacyMath;

impl StableSwapMath for LegacyMath {
    fn compute_invariant(&self, xp: &[U256], amp: U256) -> Result<U256, AMMError> {
        let n_coins = U256::from(xp.len());
        let (d, _) = newton_d(xp, amp, |ann, s, d, d_p| {
            let numerator = mul(add(mul(ann, s)?, mul(d_p, n_coins)?)?, d)?;
            let denominator = add(
                mul(sub(ann, U256_1)?, d)?,
                mul(add(n_coins, U256_1)?, d_p)?,
            )?;
            div(numerator, denominator)
        })?;

        Ok(d)
    }

    fn compute_y_d(&self, i: usize, xp: &[U256], amp: U256, d: U256) -> Result<U256, AMMError> {
        let n_coins = U256::from(xp.len());
        let ann = mul(amp, n_coins)?;
        let (c, s) = y_terms(i, xp, d)?;
        let c = div(mul(c, d)?, mul(ann, n_coins)?)?;
        let b = add(s, div(d, ann)?)?;

        let (y, _) = newton_y(c, b, d)?;
        Ok(y)
    }
}
