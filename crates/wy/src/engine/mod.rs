pub mod counter;
pub mod timing;
