// Measures one-subject evaluation cost across derivative orders and
// subject sizes. The fourth-order tier is the expensive one (partition
// sums plus rank-5 contractions), so the spread between `value` and
// `fourth` is the number that matters for optimizer inner loops.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use mixedlik::fixtures::{
    DiagonalCovariance, ExpProductMap, MonomialScale, MonomialTrajectory, Monomials,
};
use mixedlik::{
    DerivOrder, EvalSettings, NoiseKind, Parameters, PriorKind, SubjectData, SubjectModel,
    TimeKind, evaluate_subject,
};
use ndarray::{Array1, Array2, array};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const M: usize = 2;

fn random_monomials(rng: &mut StdRng, n: usize, positive_offset: bool) -> Monomials {
    Monomials {
        offset: Array1::from_shape_fn(n, |_| {
            if positive_offset {
                0.3 + rng.gen_range(0.0..0.5)
            } else {
                rng.gen_range(-0.5..0.5)
            }
        }),
        coeff: Array1::from_shape_fn(n, |_| 0.1 + rng.gen_range(0.0..0.9)),
        expo: Array2::from_shape_fn((n, M), |_| rng.gen_range(-1.0..1.5)),
    }
}

fn subject(n_y: usize, n_t: usize) -> (MonomialTrajectory, MonomialScale, MonomialScale, SubjectData) {
    let mut rng = StdRng::seed_from_u64(0x0b5e_11ed + n_y as u64);
    let traj = MonomialTrajectory {
        y: random_monomials(&mut rng, n_y, true),
        t: random_monomials(&mut rng, n_t, true),
        r: random_monomials(&mut rng, n_t, true),
    };
    let noise_scale = MonomialScale(random_monomials(&mut rng, n_y, true));
    let time_scale = MonomialScale(random_monomials(&mut rng, n_t, true));
    let data = SubjectData {
        ym: Array1::from_shape_fn(n_y, |_| 0.5 + rng.gen_range(0.0..1.0)),
        ind_y: (0..n_y).collect(),
        tm: Array1::from_shape_fn(n_t, |_| rng.gen_range(0.5..2.0)),
        ind_t: (0..n_t).collect(),
        time: Array1::linspace(0.0, 1.0, 8),
        covariates: Array1::zeros(0),
        subject: 0,
    };
    (traj, noise_scale, time_scale, data)
}

fn benchmark_evaluate(c: &mut Criterion) {
    let point = Parameters {
        beta: array![1.3, 0.9],
        b: array![0.2, -0.3],
        delta: array![0.1, -0.2],
    };
    let settings = EvalSettings::default();
    let orders = [
        ("value", DerivOrder::Value),
        ("second", DerivOrder::Second),
        ("fourth", DerivOrder::Fourth),
    ];

    let mut group = c.benchmark_group("evaluate_subject");
    for n_y in [10_usize, 50, 200] {
        let (traj, noise_scale, time_scale, data) = subject(n_y, n_y / 5);
        let model = SubjectModel {
            covariance: &DiagonalCovariance,
            map: &ExpProductMap,
            simulator: &traj,
            noise_scale: &noise_scale,
            time_scale: &time_scale,
            noise_kind: NoiseKind::Normal,
            time_kind: TimeKind::Normal,
            prior_kind: PriorKind::Normal,
        };
        for (name, order) in orders {
            group.bench_with_input(
                BenchmarkId::new(name, n_y),
                &order,
                |bench, &order| {
                    bench.iter(|| {
                        let out = evaluate_subject(
                            black_box(&model),
                            black_box(&data),
                            black_box(&point),
                            order,
                            &settings,
                        )
                        .unwrap();
                        black_box(out);
                    });
                },
            );
        }
    }
    group.finish();
}

criterion_group!(benches, benchmark_evaluate);
criterion_main!(benches);
