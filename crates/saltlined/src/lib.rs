//! saltlined — the master side of a saltline deployment.

pub mod handler;
pub mod master;

pub use handler::MasterHandler;
pub use master::Master;
