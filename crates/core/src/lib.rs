pub mod agreement;
pub mod lifecycle;
pub mod ports;
pub mod types;
