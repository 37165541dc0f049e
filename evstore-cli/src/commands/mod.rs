pub mod append;
pub mod config;
pub mod load;
pub mod replay;
pub mod serve;
