//! Order settlement domain module
//!
//! Contains the order entity, the ledger, the state machine service and the
//! settlement sweep.

mod ledger;
mod model;
mod scheduler;
mod service;

pub use ledger::{OrderFilter, OrderLedger};
pub use model::*;
pub use scheduler::{SettlementScheduler, SweepStats};
pub use service::OrderService;
