pub mod assembler;
pub mod events;
pub mod funnel;
pub mod model;
pub mod planner;
pub mod retry;
pub mod units;
