pub mod algorithm;
pub mod grid;
pub mod integration;
pub mod models;
pub mod settings;
