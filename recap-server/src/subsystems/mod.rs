pub mod processor;
pub mod submit;
pub mod worker;
