pub mod ai;
pub mod predict;
pub mod preprocess;
