//! Assignment of training instances to ADMM blocks.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::dataset::Instance;

#[derive(Debug, Error, PartialEq)]
pub enum PartitionError {
    #[error("number of blocks must be positive")]
    NoBlocks,

    #[error("record {record} has no partition key")]
    MissingKey { record: usize },

    #[error("record {record}: partition key '{key}' is not a block id below {num_blocks}")]
    BadKey {
        record: usize,
        key: String,
        num_blocks: u32,
    },
}

/// How records are mapped to blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionPolicy {
    /// Each record carries its block id in its `key` field.
    ByKey,
    /// Uniform assignment from a seeded generator.
    Random { seed: u64 },
}

impl Default for PartitionPolicy {
    fn default() -> Self {
        PartitionPolicy::Random { seed: 0 }
    }
}

/// Groups records into `num_blocks` blocks; every block id is present in the
/// result, possibly empty.
///
/// With `click_replicates = r > 1` every positive record has its weight
/// divided by `r`. Under random assignment a positive is also copied into
/// `r` consecutive blocks, wrapping at `num_blocks`.
pub fn assign_partitions<I>(
    records: I,
    num_blocks: u32,
    policy: PartitionPolicy,
    click_replicates: u32,
) -> Result<BTreeMap<u32, Vec<Instance>>, PartitionError>
where
    I: IntoIterator<Item = (Option<String>, Instance)>,
{
    if num_blocks == 0 {
        return Err(PartitionError::NoBlocks);
    }
    let replicates = click_replicates.max(1);
    let mut blocks: BTreeMap<u32, Vec<Instance>> = (0..num_blocks).map(|p| (p, Vec::new())).collect();
    let mut rng = match policy {
        PartitionPolicy::Random { seed } => Some(StdRng::seed_from_u64(seed)),
        PartitionPolicy::ByKey => None,
    };

    for (record, (key, mut instance)) in records.into_iter().enumerate() {
        let positive = instance.label > 0;
        if positive {
            instance.weight /= f64::from(replicates);
        }
        match rng.as_mut() {
            Some(rng) => {
                let first = rng.gen_range(0..num_blocks);
                let copies = if positive { replicates } else { 1 };
                for offset in 1..copies {
                    let p = (first + offset) % num_blocks;
                    blocks.entry(p).or_default().push(instance.clone());
                }
                blocks.entry(first).or_default().push(instance);
            }
            None => {
                let key = key.ok_or(PartitionError::MissingKey { record })?;
                let block = key
                    .trim()
                    .parse::<u32>()
                    .ok()
                    .filter(|p| *p < num_blocks)
                    .ok_or_else(|| PartitionError::BadKey {
                        record,
                        key: key.clone(),
                        num_blocks,
                    })?;
                blocks.entry(block).or_default().push(instance);
            }
        }
    }
    Ok(blocks)
}
