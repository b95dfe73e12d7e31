mod ledger;
mod pricing;
mod savings;
mod tracker;

pub use ledger::{CostDirection, CostEntry};
pub use pricing::{ModelPrice, PricingTable, context_window};
pub use savings::{SavingsSnapshot, SavingsTracker};
pub use tracker::{Admission, CostTracker};
