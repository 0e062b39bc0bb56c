pub mod batch;
pub mod events;
pub mod session;
pub mod summary;
