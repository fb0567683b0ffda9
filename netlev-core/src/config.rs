//! Process-wide configuration for the shuffle transport.
//!
//! Loaded from a TOML document via `serdeconv`, with every field defaulting to the
//! value a deployed shuffle task would compile in, matching the `gamerunner_config`/
//! `authenticator` configuration pattern: a plain serde struct with `#[serde(default)]`
//! fields rather than a builder.

use serde_derive::{Deserialize, Serialize};
use std::path::Path;

/// `WQES_PER_CONN` - receive queue depth and credit ceiling, per connection.
pub const DEFAULT_WQES_PER_CONN: u32 = 400;
pub const DEFAULT_SIGNAL_INTERVAL: u32 = 64;
pub const DEFAULT_NETLEV_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_RECONNECT_TRIES: u32 = 5;
pub const DEFAULT_COMPRESSION_BUFFER_RATIO: f64 = 0.20;
pub const DEFAULT_RDMA_BUF_SIZE: usize = 1024 * 1024;

/// `NETLEV_FETCH_REQSIZE` - size in bytes of the payload area following the wire header.
pub const NETLEV_FETCH_REQSIZE: usize = 800;
/// `NETLEV_MOF_PATH_MAX_SIZE` - longest path accepted in a fetch request or ack.
pub const NETLEV_MOF_PATH_MAX_SIZE: usize = 600;
/// `NETLEV_RDMA_MEM_CHUNKS_NUM` - default pair count for the client buffer pool.
pub const NETLEV_RDMA_MEM_CHUNKS_NUM: usize = 1000;

/// Per-wakeup completion processing cap, bounding latency for other descriptors
/// registered on the same event loop.
pub const MAX_CQ_EVENTS_PER_WAKE_CLIENT: usize = 1000;
pub const MAX_CQ_EVENTS_PER_WAKE_SERVER: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShuffleConfig {
    /// Receive work entries (and credit ceiling) per connection.
    pub wqes_per_conn: u32,
    /// Send completions are marked signalled every `signal_interval` posts on the client.
    pub signal_interval: u32,
    /// Address resolution timeout for a client connect attempt, in milliseconds.
    pub netlev_timeout_ms: u64,
    /// Number of connect attempts before a peer is considered unreachable.
    pub reconnect_tries: u32,
    /// `mapred.rdma.mem.use.contig.pages` - use host-provided contiguous memory for the
    /// buffer pool instead of a page-aligned allocation.
    pub use_contig_pages: bool,
    /// `mapred.rdma.compression.buffer.ratio` - fraction of a pair reserved for the
    /// primary (RDMA landing) buffer when compression is enabled.
    pub compression_buffer_ratio: f64,
    /// `mapred.rdma.buf.size` - size in bytes of a pair when compression is disabled,
    /// and the hard cap on the primary buffer when it is enabled.
    pub rdma_buf_size: usize,
    /// Number of paired buffer slots to allocate in the client's buffer pool.
    pub num_pairs: usize,
    /// Whether compression is enabled for this job; drives pair sizing (§4.5).
    pub compression_enabled: bool,
}

impl Default for ShuffleConfig {
    fn default() -> Self {
        ShuffleConfig {
            wqes_per_conn: DEFAULT_WQES_PER_CONN,
            signal_interval: DEFAULT_SIGNAL_INTERVAL,
            netlev_timeout_ms: DEFAULT_NETLEV_TIMEOUT_MS,
            reconnect_tries: DEFAULT_RECONNECT_TRIES,
            use_contig_pages: false,
            compression_buffer_ratio: DEFAULT_COMPRESSION_BUFFER_RATIO,
            rdma_buf_size: DEFAULT_RDMA_BUF_SIZE,
            num_pairs: NETLEV_RDMA_MEM_CHUNKS_NUM,
            compression_enabled: false,
        }
    }
}

impl ShuffleConfig {
    /// Load configuration from a TOML file, falling back to defaults for any field the
    /// document omits. Fatal if the file exists but fails to parse.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<ShuffleConfig, serdeconv::Error> {
        serdeconv::from_toml_file(path.as_ref())
    }

    /// Sizes of the primary/secondary buffers within a pair, per §4.5.
    pub fn pair_size(&self) -> (usize, usize) {
        if self.compression_enabled {
            let primary = ((self.rdma_buf_size as f64) * self.compression_buffer_ratio) as usize;
            let primary = primary.min(self.rdma_buf_size);
            (primary, self.rdma_buf_size)
        } else {
            (self.rdma_buf_size, self.rdma_buf_size)
        }
    }
}
