//! Configuration types for the network abstraction layer.

/// Message tag.
pub type Tag = u32;

/// Offset into a registered memory region.
pub type Offset = u64;

/// Upper bound, in milliseconds, on a single blocking progress or trigger
/// call. Passing this value means "block indefinitely" up to this ceiling.
pub const MAX_IDLE_TIME: u32 = 3600 * 1000;

/// Progress mode flag: busy-spin only, never block in progress.
pub const NO_BLOCK: u8 = 0x01;
/// Progress mode flag: do not retry transient transport failures internally.
pub const NO_RETRY: u8 = 0x02;

/// Thread mode flag: only one thread will access the class at a time.
pub const THREAD_MODE_SINGLE_CLS: u8 = 0x01;
/// Thread mode flag: only one thread will access a context at a time.
pub const THREAD_MODE_SINGLE_CTX: u8 = 0x02;
/// Thread mode flag: fully single-threaded access.
pub const THREAD_MODE_SINGLE: u8 = THREAD_MODE_SINGLE_CLS | THREAD_MODE_SINGLE_CTX;

/// Preferred address format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddrFormat {
    /// Leave the choice to the plugin.
    #[default]
    Unspec,
    /// Use IPv4 when available.
    Ipv4,
    /// Use IPv6 when available.
    Ipv6,
    /// Use the transport's native addressing when available.
    Native,
}

/// Memory type of a registered region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemType {
    /// Default system memory.
    #[default]
    Host,
    /// NVIDIA CUDA memory.
    Cuda,
    /// AMD ROCm memory.
    Rocm,
    /// Intel Level Zero memory.
    Ze,
}

/// Class initialization options.
///
/// All fields are hints or caller contracts; a zero/empty field means
/// "plugin default".
#[derive(Debug, Clone)]
pub struct InitInfo {
    /// Preferred local IP subnet.
    pub ip_subnet: Option<String>,
    /// Shared secret for authenticated transports. All peers must use the
    /// same key in order to communicate.
    pub auth_key: Option<String>,
    /// Hint overriding the plugin's unexpected-message size ceiling.
    /// 0 means plugin default.
    pub max_unexpected_size: usize,
    /// Hint overriding the plugin's expected-message size ceiling.
    /// 0 means plugin default.
    pub max_expected_size: usize,
    /// Progress mode bitmask ([`NO_BLOCK`], [`NO_RETRY`]).
    pub progress_mode: u8,
    /// Preferred address format.
    pub addr_format: AddrFormat,
    /// Upper bound on concurrently created contexts.
    /// Default: 1
    pub max_contexts: u8,
    /// Thread mode bitmask ([`THREAD_MODE_SINGLE_CLS`],
    /// [`THREAD_MODE_SINGLE_CTX`]). A caller promise, not an enforced lock.
    pub thread_mode: u8,
    /// Request support for transfers to/from device memory (GPU).
    /// Default: false
    pub request_mem_device: bool,
}

impl Default for InitInfo {
    fn default() -> Self {
        Self {
            ip_subnet: None,
            auth_key: None,
            max_unexpected_size: 0,
            max_expected_size: 0,
            progress_mode: 0,
            addr_format: AddrFormat::Unspec,
            max_contexts: 1,
            thread_mode: 0,
            request_mem_device: false,
        }
    }
}

impl InitInfo {
    /// Create init options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the preferred local IP subnet.
    pub fn with_ip_subnet(mut self, subnet: impl Into<String>) -> Self {
        self.ip_subnet = Some(subnet.into());
        self
    }

    /// Set the shared authentication key.
    pub fn with_auth_key(mut self, key: impl Into<String>) -> Self {
        self.auth_key = Some(key.into());
        self
    }

    /// Set the unexpected-message size ceiling hint.
    pub fn with_max_unexpected_size(mut self, size: usize) -> Self {
        self.max_unexpected_size = size;
        self
    }

    /// Set the expected-message size ceiling hint.
    pub fn with_max_expected_size(mut self, size: usize) -> Self {
        self.max_expected_size = size;
        self
    }

    /// Set the progress mode bitmask.
    pub fn with_progress_mode(mut self, mode: u8) -> Self {
        self.progress_mode = mode;
        self
    }

    /// Set the preferred address format.
    pub fn with_addr_format(mut self, format: AddrFormat) -> Self {
        self.addr_format = format;
        self
    }

    /// Set the maximum number of contexts.
    pub fn with_max_contexts(mut self, max: u8) -> Self {
        self.max_contexts = max;
        self
    }

    /// Set the thread mode bitmask.
    pub fn with_thread_mode(mut self, mode: u8) -> Self {
        self.thread_mode = mode;
        self
    }

    /// Enable device-memory registration support.
    pub fn with_mem_device(mut self, request: bool) -> Self {
        self.request_mem_device = request;
        self
    }
}
