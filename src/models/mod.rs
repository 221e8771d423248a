pub mod admin;
pub mod job;
pub mod payload;
