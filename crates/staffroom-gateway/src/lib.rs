pub mod hub;
pub mod session;
