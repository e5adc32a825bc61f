//! Branch navigation: sibling indicators and branch operation round trips.

pub mod branch_ops;
pub mod position;

pub use branch_ops::{BranchNavigator, Direction, SwitchPlan};
pub use position::{BranchPosition, BranchPositions};
