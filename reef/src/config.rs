/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Memory held by a batch before staged values spill to the chunk
    /// store.
    pub batch_memory_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            batch_memory_limit: 4 * 1024 * 1024,
        }
    }
}
