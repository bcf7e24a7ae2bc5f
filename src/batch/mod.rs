pub mod driver;
pub mod orchestrator;
pub mod planner;
pub mod state;
