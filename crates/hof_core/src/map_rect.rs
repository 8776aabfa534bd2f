use std::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, warn};
use rayon::prelude::*;

use crate::adapter::ShardAdapter;
use crate::autodiff::{tangents, values, Param};
use crate::error::{ensure_finite, ensure_len, Error, Result};
use crate::traits::ShardWorker;

pub(crate) const OPERATION: &str = "map_rect";

/// One unit of work: a shard's index and its slices of the argument arrays.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Shard<'a> {
    pub index: usize,
    pub theta: &'a [f64],
    pub x_r: &'a [f64],
    pub x_i: &'a [i64],
}

impl<'a> Shard<'a> {
    pub(crate) fn adapter<'b, W: ShardWorker>(
        &'b self,
        worker: &'b W,
        phi: &'b [f64],
    ) -> ShardAdapter<'b, W> {
        ShardAdapter::new(worker, phi, self.theta, self.x_r, self.x_i)
    }
}

/// Zips checked argument arrays into shard descriptors.
pub(crate) fn shards<'a>(
    thetas: &'a [Vec<f64>],
    x_r: &'a [Vec<f64>],
    x_i: &'a [Vec<i64>],
) -> Vec<Shard<'a>> {
    thetas
        .iter()
        .zip(x_r)
        .zip(x_i)
        .enumerate()
        .map(|(index, ((theta, x_r), x_i))| Shard {
            index,
            theta,
            x_r,
            x_i,
        })
        .collect()
}

/// Runs `job` for every shard on the rayon pool and returns the results in
/// shard order.
///
/// Once a shard fails, shards with a higher index that have not started yet
/// are skipped. Shards with a lower index still run, so the error reported is
/// always the one from the lowest failing index.
pub(crate) fn run_shards<R, F>(shards: &[Shard<'_>], job: F) -> Result<Vec<R>>
where
    R: Send,
    F: Fn(&Shard<'_>) -> Result<R> + Sync,
{
    let lowest_failure = AtomicUsize::new(usize::MAX);
    let results: Vec<Option<Result<R>>> = shards
        .par_iter()
        .map(|shard| {
            if shard.index > lowest_failure.load(Ordering::Acquire) {
                return None;
            }
            let result = job(shard);
            if result.is_err() {
                lowest_failure.fetch_min(shard.index, Ordering::AcqRel);
            }
            Some(result)
        })
        .collect();

    let skipped = results.iter().filter(|r| r.is_none()).count();
    let mut values = Vec::with_capacity(shards.len());
    for (shard, result) in results.into_iter().enumerate() {
        match result {
            Some(Ok(value)) => values.push(value),
            Some(Err(source)) => {
                warn!("{OPERATION}: shard {shard} failed, {skipped} later shards skipped");
                return Err(Error::Shard {
                    shard,
                    source: Box::new(source),
                })
            }
            None => {}
        }
    }
    Ok(values)
}

/// Checks that the per-shard arrays agree on the shard count and that each is
/// rectangular.
pub(crate) fn check_shards<T>(
    phi: &[f64],
    thetas: &[Vec<T>],
    x_r: &[Vec<f64>],
    x_i: &[Vec<i64>],
) -> Result<()> {
    let shards = thetas.len();
    ensure_len(OPERATION, "x_r", shards, x_r.len())?;
    ensure_len(OPERATION, "x_i", shards, x_i.len())?;
    if let (Some(theta), Some(reals), Some(ints)) = (thetas.first(), x_r.first(), x_i.first()) {
        for n in 1..shards {
            ensure_len(OPERATION, "shard parameters", theta.len(), thetas[n].len())?;
            ensure_len(OPERATION, "shard reals", reals.len(), x_r[n].len())?;
            ensure_len(OPERATION, "shard integers", ints.len(), x_i[n].len())?;
        }
    }
    ensure_finite(OPERATION, "phi", phi)?;
    for reals in x_r {
        ensure_finite(OPERATION, "x_r", reals)?;
    }
    Ok(())
}

/// Applies `worker(phi, thetas[n], x_r[n], x_i[n])` to every shard in
/// parallel and concatenates the outputs in shard order.
///
/// Shards may return outputs of different lengths. Any shard failure aborts
/// the call with [`Error::Shard`] for the lowest failing index.
pub fn map_rect<W, P>(
    worker: &W,
    phi: &[P],
    thetas: &[Vec<P>],
    x_r: &[Vec<f64>],
    x_i: &[Vec<i64>],
) -> Result<Vec<P>>
where
    W: ShardWorker,
    P: Param,
{
    let phi_values = values(phi);
    check_shards(&phi_values, thetas, x_r, x_i)?;
    let theta_values: Vec<Vec<f64>> = thetas.iter().map(|theta| values(theta)).collect();
    for theta in &theta_values {
        ensure_finite(OPERATION, "theta", theta)?;
    }

    let work = shards(&theta_values, x_r, x_i);
    let outputs: Vec<Vec<P>> = if P::TRACKED {
        let phi_dot = tangents(phi);
        run_shards(&work, |shard| {
            let theta_dot = tangents(&thetas[shard.index]);
            let (value, tangent) = shard
                .adapter(worker, &phi_values)
                .directional(&phi_dot, &theta_dot)?;
            Ok(value
                .into_iter()
                .zip(tangent)
                .map(|(v, dv)| P::from_parts(v, dv))
                .collect())
        })?
    } else {
        run_shards(&work, |shard| {
            Ok(shard
                .adapter(worker, &phi_values)
                .evaluate()?
                .into_iter()
                .map(|v| P::from_parts(v, 0.0))
                .collect())
        })?
    };

    let result: Vec<P> = outputs.into_iter().flatten().collect();
    debug!("{OPERATION}: {} shards, {} outputs", thetas.len(), result.len());
    Ok(result)
}
