pub mod compare;
pub mod domain;
pub mod engine;
pub mod errors;
pub mod languages;
pub mod pool;
pub mod protocol;
pub mod traits;
