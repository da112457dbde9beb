pub mod context;
pub mod guards;
pub mod interpreter;
pub mod planner;
pub mod resolver;
pub mod staircase;
