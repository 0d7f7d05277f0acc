//! ledgerindex-evm — EVM chain source, indexing orchestrator, and resume/replay.

pub mod builder;
pub mod fetcher;
pub mod index_loop;
pub mod resume;
pub mod rpc;

pub use builder::{source_config, IndexerBuilder};
pub use fetcher::{EvmChainSource, EvmFetcher, EvmSourceConfig, RawLog, TRANSFER_TOPIC};
pub use index_loop::Indexer;
pub use resume::{RangeProcessor, ResumeManager};
pub use rpc::{EvmRpcClient, HttpClientConfig, HttpEvmClient};
