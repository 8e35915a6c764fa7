use crate::{compaction, files::FileSet, index::MemoryGauge};
use commonware_runtime::{Metrics, Storage};
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};

/// Metrics of one table.
#[derive(Default)]
pub struct Statistics {
    pub hash_index_mb: MemoryGauge,
    pub leaf_index_mb: MemoryGauge,
    pub bucket_index_mb: MemoryGauge,
    pub total_index_mb: MemoryGauge,

    pub hash_files: Gauge,
    pub leaf_files: Gauge,
    pub bucket_files: Gauge,
    pub hash_store_bytes: Gauge,
    pub leaf_store_bytes: Gauge,
    pub bucket_store_bytes: Gauge,

    pub flushes: Counter,
    pub chunks_written: Counter,
    pub leaves_written: Counter,
    pub leaves_deleted: Counter,

    pub hash_reads: Counter,
    pub leaf_reads: Counter,
    pub leaf_key_reads: Counter,

    pub compaction: compaction::Metrics,
}

impl Statistics {
    /// Register every metric with `context` (labeled with the table name by the caller).
    pub fn register(&self, context: &impl Metrics) {
        context.register(
            "hash_index_mb",
            "Memory reserved by the hash chunk index (MB)",
            self.hash_index_mb.clone(),
        );
        context.register(
            "leaf_index_mb",
            "Memory reserved by the leaf index (MB)",
            self.leaf_index_mb.clone(),
        );
        context.register(
            "bucket_index_mb",
            "Memory reserved by the key bucket index (MB)",
            self.bucket_index_mb.clone(),
        );
        context.register(
            "total_index_mb",
            "Memory reserved by all indices of the table (MB)",
            self.total_index_mb.clone(),
        );
        context.register(
            "hash_files",
            "Number of hash chunk data files",
            self.hash_files.clone(),
        );
        context.register("leaf_files", "Number of leaf data files", self.leaf_files.clone());
        context.register(
            "bucket_files",
            "Number of key bucket data files",
            self.bucket_files.clone(),
        );
        context.register(
            "hash_store_bytes",
            "Size of the hash chunk data files",
            self.hash_store_bytes.clone(),
        );
        context.register(
            "leaf_store_bytes",
            "Size of the leaf data files",
            self.leaf_store_bytes.clone(),
        );
        context.register(
            "bucket_store_bytes",
            "Size of the key bucket data files",
            self.bucket_store_bytes.clone(),
        );
        context.register("flushes", "Number of batches saved", self.flushes.clone());
        context.register(
            "chunks_written",
            "Number of hash chunks written",
            self.chunks_written.clone(),
        );
        context.register(
            "leaves_written",
            "Number of leaves written",
            self.leaves_written.clone(),
        );
        context.register(
            "leaves_deleted",
            "Number of leaves deleted",
            self.leaves_deleted.clone(),
        );
        context.register("hash_reads", "Number of hash chunk reads", self.hash_reads.clone());
        context.register("leaf_reads", "Number of leaf reads by path", self.leaf_reads.clone());
        context.register(
            "leaf_key_reads",
            "Number of key lookups",
            self.leaf_key_reads.clone(),
        );
        context.register(
            "compactions_completed",
            "Number of compactions that ran to completion",
            self.compaction.completed.clone(),
        );
        context.register(
            "compactions_interrupted",
            "Number of compactions interrupted",
            self.compaction.interrupted.clone(),
        );
        context.register(
            "compactions_failed",
            "Number of compactions that failed",
            self.compaction.failed.clone(),
        );
        context.register(
            "compacted_files",
            "Number of data files merged by compaction",
            self.compaction.merged_files.clone(),
        );
    }

    /// Refresh the file gauges from the file sets of the table.
    pub fn update_files<E: Storage>(
        &self,
        hashes: &FileSet<E>,
        leaves: &FileSet<E>,
        buckets: &FileSet<E>,
    ) {
        self.hash_files.set(hashes.len() as i64);
        self.leaf_files.set(leaves.len() as i64);
        self.bucket_files.set(buckets.len() as i64);
        self.hash_store_bytes.set(hashes.size() as i64);
        self.leaf_store_bytes.set(leaves.size() as i64);
        self.bucket_store_bytes.set(buckets.size() as i64);
    }
}
