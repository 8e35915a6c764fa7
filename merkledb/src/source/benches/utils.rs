//! Helpers shared by the `source` benchmarks.

use commonware_merkledb::{
    compaction::Executor,
    hashes::{path_to_chunk_id, Digest, HashChunk, DIGEST_SIZE},
    leaves::LeafRecord,
    source::{Builder, Config, DataSource},
};
use commonware_runtime::tokio::Context;
use rand::{rngs::StdRng, RngCore, SeedableRng};
use std::{collections::BTreeMap, sync::Arc};

/// Name of the table used across all benchmarks.
pub const TABLE: &str = "merkledb_bench";

/// Height of every hash chunk.
pub const HEIGHT: u8 = 6;

/// Concrete table type for benchmarks.
pub type Table = DataSource<Context>;

/// Create a builder for tables keeping hashes of paths below `threshold` in memory.
pub fn builder(context: Context, threshold: u64) -> Builder<Context> {
    let cfg = Config {
        initial_capacity: 1 << 16,
        hashes_ram_to_disk_threshold: threshold,
        chunk_height: HEIGHT,
        compaction_enabled: false,
        max_num_of_keys: 1 << 22,
        index_chunk_size: 1 << 14,
        ..Config::default()
    };
    Builder::new(context, cfg).with_executor(Arc::new(Executor::new(1)))
}

/// Leaf range of a tree with `leaves` leaves.
pub fn range(leaves: u64) -> (u64, u64) {
    (leaves - 1, 2 * leaves - 2)
}

/// Generate the chunks and leaves of a tree with `leaves` random leaves.
pub fn tree(leaves: u64, seed: u64) -> (Vec<HashChunk>, Vec<LeafRecord>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let (first, last) = range(leaves);
    let mut chunks: BTreeMap<u64, HashChunk> = BTreeMap::new();
    let mut bytes = [0u8; DIGEST_SIZE];
    for path in 1..=last {
        rng.fill_bytes(&mut bytes);
        let id = path_to_chunk_id(path, HEIGHT);
        chunks
            .entry(id)
            .or_insert_with(|| HashChunk::with_id(id, HEIGHT).unwrap())
            .set_hash_at_path(path, Digest::from(bytes))
            .unwrap();
    }
    let records = (first..=last)
        .map(|path| {
            let mut value = vec![0u8; 32];
            rng.fill_bytes(&mut value);
            LeafRecord::new(path, format!("key{path}").into_bytes(), value)
        })
        .collect();
    (chunks.into_values().collect(), records)
}
