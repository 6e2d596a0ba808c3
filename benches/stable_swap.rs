use alloy::primitives::U256;
use amms_sync::amms::{
    curve::math::{ImplementationName, StableSwapMath},
    error::AMMError,
};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

const RATES_DECIMALS: [u8; 3] = [18, 6, 6];

fn balances() -> Vec<U256> {
    vec![
        U256::from(120_000_000_u64) * U256::from(10).pow(U256::from(18)),
        U256::from(95_000_000_000_000_u64),
        U256::from(40_000_000_000_000_u64),
    ]
}

fn swap(math: &dyn StableSwapMath, amp: U256, rates: &[U256], dx: U256) -> Result<U256, AMMError> {
    math.compute_output_amount(amp, U256::from(1_000_000), rates, &balances(), 0, 2, dx)
}

fn compute_output_amount(c: &mut Criterion) {
    let mut group = c.benchmark_group("stable_swap_output");
    let amounts = [1_u64, 1_000, 1_000_000, 50_000_000]
        .map(|units| U256::from(units) * U256::from(10).pow(U256::from(18)));

    for (implementation, amp) in [
        (ImplementationName::FactoryPlain, U256::from(200_000)),
        (ImplementationName::Legacy, U256::from(2_000)),
    ] {
        let math = implementation.math();
        let rates = math.compute_scaling_factors(&RATES_DECIMALS);

        for dx in amounts {
            group.bench_with_input(
                BenchmarkId::new(format!("{implementation:?}"), dx),
                &dx,
                |b, dx| b.iter(|| swap(math, amp, &rates, *dx)),
            );
        }
    }

    group.finish();
}

criterion_group!(stable_swap, compute_output_amount);
criterion_main!(stable_swap);
