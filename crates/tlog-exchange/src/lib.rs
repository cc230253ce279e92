//! # tlog-exchange
//!
//! Pairwise replication for Tamperlog repositories.
//!
//! Two peers connected by any ordered frame channel run one exchange: each
//! side pulls the other's missing history, verifies it, and both commit
//! matching witness blocks so that their roots converge.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tlog_chain::{Repository, SigningIdentity};
//! use tlog_exchange::{run_exchange, ExchangeConfig, MemoryChannel};
//!
//! async fn sync(a: Arc<Repository>, alice: SigningIdentity, b: Arc<Repository>, bob: SigningIdentity) {
//!     let (left, right) = MemoryChannel::pair();
//!     let config = ExchangeConfig::default();
//!     let (ra, rb) = tokio::join!(
//!         run_exchange(Arc::new(left), a.clone(), alice, &config),
//!         run_exchange(Arc::new(right), b.clone(), bob, &config),
//!     );
//!     assert_eq!(ra.unwrap().new_root, rb.unwrap().new_root);
//! }
//! ```

mod channel;
mod config;
mod error;
mod exchange;
mod merge;
mod message;
mod service;

pub use channel::{read_frame, write_frame, FrameChannel, MemoryChannel, StreamChannel};
pub use config::{ExchangeConfig, ExchangeConfigBuilder};
pub use error::{ChannelError, ExchangeError, Result};
pub use exchange::{
    run_exchange, run_exchange_at, Connector, ExchangeReport, ExchangeState, Exchanger,
};
pub use merge::{MergeOutcome, MergeReport};
pub use message::{ExchangeMessage, MessageKind, Retrieval, PROTOCOL_VERSION};
pub use service::{ExchangeContext, ServiceProtocol};
