use bitcoin::Network;
use blkdb_primitives::{DbType, PruneType};

/// Configuration of a block data store.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Network whose magic bytes tag the database.
    pub network: Network,

    /// Which records are kept, and how completely.
    pub db_type: DbType,

    /// Whether spent history is pruned.
    pub prune_type: PruneType,

    /// RocksDB write buffer size in bytes (default: 256 MB)
    pub write_buffer_size: usize,

    /// Maximum number of RocksDB write buffers
    pub max_write_buffer_number: i32,

    /// Target SST file size in bytes
    pub target_file_size_base: u64,

    /// Bloom filter bits per key, `None` disables the filter
    pub bloom_filter_bits: Option<f64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            network: Network::Bitcoin,
            db_type: DbType::Full,
            prune_type: PruneType::None,
            write_buffer_size: 256 * 1024 * 1024,
            max_write_buffer_number: 4,
            target_file_size_base: 256 * 1024 * 1024,
            bloom_filter_bits: Some(10.0),
        }
    }
}

impl StoreConfig {
    /// Default configuration for `network`.
    pub fn new(network: Network) -> Self {
        Self {
            network,
            ..Default::default()
        }
    }

    /// Create a builder for configuring the store
    pub fn builder() -> StoreConfigBuilder {
        StoreConfigBuilder::default()
    }

    /// Network magic written to the database info record.
    pub fn magic(&self) -> [u8; 4] {
        self.network.magic().to_bytes()
    }
}

/// Builder pattern for StoreConfig
#[derive(Default)]
pub struct StoreConfigBuilder {
    config: StoreConfig,
}

impl StoreConfigBuilder {
    pub fn network(mut self, network: Network) -> Self {
        self.config.network = network;
        self
    }

    pub fn db_type(mut self, db_type: DbType) -> Self {
        self.config.db_type = db_type;
        self
    }

    pub fn prune_type(mut self, prune_type: PruneType) -> Self {
        self.config.prune_type = prune_type;
        self
    }

    /// Set RocksDB write buffer size in MB
    pub fn write_buffer_mb(mut self, size: usize) -> Self {
        self.config.write_buffer_size = size * 1024 * 1024;
        self
    }

    pub fn bloom_filter_bits(mut self, bits: Option<f64>) -> Self {
        self.config.bloom_filter_bits = bits;
        self
    }

    pub fn build(self) -> StoreConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magic_follows_network() {
        assert_eq!(StoreConfig::default().magic(), [0xf9, 0xbe, 0xb4, 0xd9]);
        assert_eq!(StoreConfig::new(Network::Testnet).magic(), [0x0b, 0x11, 0x09, 0x07]);
    }

    #[test]
    fn test_builder() {
        let config = StoreConfig::builder()
            .network(Network::Regtest)
            .db_type(DbType::Lite)
            .prune_type(PruneType::All)
            .write_buffer_mb(8)
            .bloom_filter_bits(None)
            .build();
        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.db_type, DbType::Lite);
        assert_eq!(config.prune_type, PruneType::All);
        assert_eq!(config.write_buffer_size, 8 * 1024 * 1024);
        assert_eq!(config.bloom_filter_bits, None);
    }
}
