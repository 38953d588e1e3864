//! Domain layer: the transaction cache itself.

pub mod service;

pub use service::{
    MissingTransactions, SetContentsOutcome, TransactionService, TxServiceConfig,
    TxServiceCounters,
};
