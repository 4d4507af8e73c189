//! Buffer cache statistics collection and reporting.
//!
//! This module tracks what the cache did over its lifetime. It provides:
//! 1. **Buffers:** Creations, deletions, overlap joins and stream leaps.
//! 2. **Lookups:** Obtain calls and how many were served by the fast path.
//! 3. **Transfers:** Upload and download counts and bytes.
//! 4. **Coherence:** Invalidations, read waits and processed page faults.

/// Buffer cache statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Buffers allocated by the creation path.
    pub buffers_created: u64,
    /// Buffers tombstoned (absorbed by a join or invalidated).
    pub buffers_deleted: u64,
    /// Buffers absorbed into a larger replacement.
    pub overlaps_joined: u64,
    /// Overlap resolutions that triggered a stream leap.
    pub stream_leaps: u64,

    /// Calls to `obtain_buffer`.
    pub obtain_calls: u64,
    /// Obtain calls served by an existing covering buffer.
    pub fast_path_hits: u64,

    /// Upload copies recorded (one per contiguous dirty run).
    pub uploads: u64,
    /// Bytes uploaded from guest memory.
    pub upload_bytes: u64,
    /// Texel buffer ranges sourced from the texture cache.
    pub image_copies: u64,
    /// Downloads scheduled by commits.
    pub downloads_scheduled: u64,
    /// Bytes scheduled for download.
    pub download_bytes: u64,
    /// Downloads completed by the worker.
    pub downloads_completed: u64,

    /// Calls to `invalidate_memory`.
    pub invalidations: u64,
    /// `read_memory` calls that had to block on a download.
    pub read_waits: u64,
    /// Faulting pages materialized by `process_fault_buffer`.
    pub faults_processed: u64,
}

/// Section names for selective stats output.
///
/// Valid section identifiers: `"buffers"`, `"transfers"`, `"coherence"`.
/// Pass an empty slice to `print_sections` to print all sections.
pub const STATS_SECTIONS: &[&str] = &["buffers", "transfers", "coherence"];

impl CacheStats {
    /// Returns the fraction of obtain calls served by the fast path, in percent.
    pub fn fast_path_rate(&self) -> f64 {
        if self.obtain_calls == 0 {
            0.0
        } else {
            self.fast_path_hits as f64 / self.obtain_calls as f64 * 100.0
        }
    }

    /// Prints only the requested statistics sections to stdout.
    ///
    /// # Arguments
    ///
    /// * `sections` - Slice of section names from [`STATS_SECTIONS`], or empty for all.
    pub fn print_sections(&self, sections: &[String]) {
        let want = |s: &str| sections.is_empty() || sections.iter().any(|x| x == s);

        println!("\n==========================================================");
        println!("BUFFER CACHE STATISTICS");
        println!("==========================================================");
        if want("buffers") {
            println!("BUFFERS");
            println!("  buffers.created        {}", self.buffers_created);
            println!("  buffers.deleted        {}", self.buffers_deleted);
            println!("  overlaps.joined        {}", self.overlaps_joined);
            println!("  stream.leaps           {}", self.stream_leaps);
            println!("  obtain.calls           {}", self.obtain_calls);
            println!(
                "  obtain.fast_path       {} ({:.2}%)",
                self.fast_path_hits,
                self.fast_path_rate()
            );
            println!("----------------------------------------------------------");
        }
        if want("transfers") {
            println!("TRANSFERS");
            println!("  uploads                {}", self.uploads);
            println!("  upload.bytes           {}", self.upload_bytes);
            println!("  image.copies           {}", self.image_copies);
            println!("  downloads.scheduled    {}", self.downloads_scheduled);
            println!("  downloads.completed    {}", self.downloads_completed);
            println!("  download.bytes         {}", self.download_bytes);
            println!("----------------------------------------------------------");
        }
        if want("coherence") {
            println!("COHERENCE");
            println!("  invalidations          {}", self.invalidations);
            println!("  read.waits             {}", self.read_waits);
            println!("  faults.processed       {}", self.faults_processed);
        }
        println!("==========================================================");
    }

    /// Prints all statistics sections to stdout.
    ///
    /// Equivalent to `print_sections(&[])`.
    pub fn print(&self) {
        self.print_sections(&[]);
    }
}
