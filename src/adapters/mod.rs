pub mod ai;
pub mod database;
pub mod memory;
pub mod repository;
pub mod storage;
