//! # poavm: a single-node proof-of-authority chain with a 256-bit VM
//!
//! This crate is a complete, self-contained execution stack for an
//! Ethereum-style chain:
//!
//! - [core]: a stack-based virtual machine over 256-bit words, with linear
//!   memory, per-frame gas accounting and a non-recursive interpreter.
//! - [state]: the world state (accounts, balances, code, storage) with
//!   journal-backed nested snapshots.
//! - [executor]: drives a single transaction through validation, gas
//!   charging, the VM, refunds and snapshot settlement.
//! - [txpool]: admission control and nonce-aware pending/queued buckets
//!   with gas-price-priority block selection.
//! - [consensus]: round-robin proof-of-authority with liveness accounting
//!   and fork choice.
//! - [processor]: assembles pool transactions into signed blocks and
//!   validates/applies received ones.
//! - [chain]: the owning orchestrator: genesis bootstrap, block append,
//!   shallow reorg, persistence through an opaque key-value store.
//!
//! The whole core is single-threaded and synchronous: one logical context
//! owns the world state, pool and consensus, and every operation either
//! completes or returns an error value. Determinism is the design currency
//! throughout; identical inputs must produce identical bytes, whether they
//! are blocks, roots or contract addresses.
//!
//! A minimal end-to-end run:
//!
//! ```
//! use poavm::chain::ChainManager;
//! use poavm::config::ChainConfig;
//! use poavm::storage::MemStore;
//! use poavm::common::Addr;
//!
//! let config = ChainConfig {
//!     validators: vec![Addr::from_slice(&[0xa1; 20])],
//!     ..ChainConfig::default()
//! };
//! let mut chain = ChainManager::new(config, MemStore::new()).unwrap();
//! let block = chain.produce_block(1_700_000_000).unwrap();
//! assert_eq!(block.header.number, 1);
//! ```

pub mod block;
pub mod chain;
pub mod common;
pub mod config;
pub mod consensus;
pub mod core;
pub mod executor;
pub mod processor;
pub mod state;
pub mod storage;
pub mod tx;
pub mod txpool;
